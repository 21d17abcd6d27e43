//! # Command-Line Interface Module
//!
//! Argument parsing for the two binaries in this crate — `chat-server` and
//! `chat-client` — using `clap`'s derive API for type-safe parsing,
//! generated help, and human-readable duration flags (e.g. `10s`, `5m`,
//! `1h`).
//!
//! Host and port are left optional on both binaries: when omitted, the
//! entrypoint prompts for them on stdin instead, matching the original
//! console tool's interactive startup. Passing them as flags skips the
//! prompt, which is convenient for scripts and tests.

use std::time::Duration;

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// A multi-user, line-protocol TCP chat server.
///
/// Accepts connections, negotiates a unique username per connection, and
/// routes messages between channels and private peers with rate limiting,
/// complaint-based bans, and replay of recent history on join.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct ServerArgs {
    /// Address to bind. If omitted, you'll be prompted for it.
    #[arg(long, help_heading = "Network")]
    pub host: Option<String>,

    /// Port to bind. If omitted, you'll be prompted for it.
    #[arg(long, help_heading = "Network")]
    pub port: Option<u16>,

    /// Number of most recent messages replayed in full to a newly named
    /// connection; older messages are marked received without resending.
    #[arg(long, help_heading = "Limits")]
    pub history_init: Option<usize>,

    /// Messages a connection may post to the default channel per rate
    /// window.
    #[arg(long, help_heading = "Limits")]
    pub rate_limit: Option<u32>,

    /// How often the per-connection rate-limit window resets (e.g. "60m").
    #[arg(long, value_parser = parse_duration, help_heading = "Limits")]
    pub rate_window: Option<Duration>,

    /// Complaints against a connection before it is banned.
    #[arg(long, help_heading = "Limits")]
    pub complaint_threshold: Option<usize>,

    /// How long a triggered ban lasts (e.g. "240m").
    #[arg(long, value_parser = parse_duration, help_heading = "Limits")]
    pub ban_duration: Option<Duration>,

    /// How long a delivered message is kept before being reaped (e.g. "60m").
    #[arg(long, value_parser = parse_duration, help_heading = "Limits")]
    pub retention: Option<Duration>,

    /// How often the retention sweep runs (e.g. "60s").
    #[arg(long, value_parser = parse_duration, help_heading = "Limits")]
    pub retention_sweep_interval: Option<Duration>,

    /// Write detailed logs to this file in addition to stdout.
    #[arg(long, help_heading = "Output")]
    pub log_file: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Suppress user-facing stdout output.
    #[arg(short = 'q', long, help_heading = "Output")]
    pub quiet: bool,
}

/// A line-protocol TCP chat client.
///
/// Connects to a chat server, negotiates a username, and provides a simple
/// console interface for chatting, switching channels, checking who's
/// online, and filing ban complaints.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct ClientArgs {
    /// Server address to connect to. If omitted, you'll be prompted for it.
    #[arg(long, help_heading = "Network")]
    pub host: Option<String>,

    /// Server port to connect to. If omitted, you'll be prompted for it.
    #[arg(long, help_heading = "Network")]
    pub port: Option<u16>,

    /// Write detailed logs to this file in addition to stdout.
    #[arg(long, help_heading = "Output")]
    pub log_file: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Suppress user-facing stdout output.
    #[arg(short = 'q', long, help_heading = "Output")]
    pub quiet: bool,
}

/// Parse a human-readable duration like `"10s"`, `"5m"`, `"1h"`, or
/// `"500ms"`. A bare number is treated as seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;

    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => unreachable!(),
    };

    Ok(Duration::from_secs_f64(secs))
}
