//! # Chat Client - Main Entry Point
//!
//! Parses arguments, initializes structured logging, prompts for a server
//! address if one wasn't given on the command line, then runs the client
//! session inside a [`tokio::task::LocalSet`].

use std::io::Write;

use anyhow::Result;
use clap::Parser;
use line_chat::{cli::ClientArgs, client, logging, ExitReason};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    let _log_guard = logging::init(args.quiet, args.verbose, args.log_file.as_deref(), "chat-client.log");

    let host = match args.host {
        Some(h) => h,
        None => prompt("Server host", "127.0.0.1"),
    };
    let port = match args.port {
        Some(p) => p,
        None => prompt("Server port", "8000").parse().unwrap_or(8000),
    };

    let local = tokio::task::LocalSet::new();
    let reason = local.run_until(client::run_client(host, port)).await?;
    // spec.md §6: exit 0 on clean shutdown, 1 on a graceful-exit signal.
    if reason == ExitReason::Signal {
        std::process::exit(1);
    }
    Ok(())
}

/// Prompt on stdin for a value, falling back to `default` if the line is
/// empty. Mirrors the original console tool's interactive startup.
fn prompt(label: &str, default: &str) -> String {
    print!("{label} [{default}]: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return default.to_string();
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}
