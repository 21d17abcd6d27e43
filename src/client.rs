//! # Client Protocol Engine
//!
//! Drives one chat session: a reader task that dispatches inbound frames
//! from the server (updating local view state and printing to the
//! console), and a stdin-reader task that turns console input into outbound
//! frames. Mirrors the server's concurrency model — both tasks run
//! `spawn_local` inside a [`tokio::task::LocalSet`], sharing a single
//! `Rc<RefCell<ClientState>>` rather than an `Arc<Mutex<_>>`, since there is
//! never more than one OS thread involved.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task;
use tracing::warn;

use crate::connection::Outbound;
use crate::protocol::{
    decode_frame, destination_matches_scope, encode_frame, ApprovalPayload, Destination, Operator, Statistics,
    WireMessage,
};
use crate::shutdown::ExitReason;

/// Local view state for one chat session: what name we negotiated (if any)
/// and which channel or peer we're currently viewing.
struct ClientState {
    own_name: Option<String>,
    current_scope: Destination,
    name_chosen: bool,
}

impl ClientState {
    fn new() -> Self {
        Self {
            own_name: None,
            current_scope: Destination::general(),
            name_chosen: false,
        }
    }
}

/// Connect to `host:port`, negotiate a name, and run the session until the
/// connection closes or the user interrupts.
///
/// Must be run inside a [`tokio::task::LocalSet`].
pub async fn run_client(host: String, port: u16) -> Result<ExitReason> {
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    task::spawn_local(writer_task(write_half, outbound_rx));

    let state = Rc::new(RefCell::new(ClientState::new()));

    let reader_state = state.clone();
    let reader_tx = outbound_tx.clone();
    let reader_task = task::spawn_local(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => handle_server_frame(&line, &reader_state, &reader_tx),
                Ok(None) => {
                    println!("the server closed the connection");
                    break;
                }
                Err(e) => {
                    println!("connection error: {e}");
                    break;
                }
            }
        }
    });

    let stdin_state = state.clone();
    let stdin_tx = outbound_tx;
    let stdin_task = task::spawn_local(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => handle_user_input(&line, &stdin_state, &stdin_tx),
                Ok(None) | Err(_) => break,
            }
        }
    });

    #[cfg(unix)]
    let shutdown = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        sigterm.recv().await;
        Ok::<(), std::io::Error>(())
    };
    #[cfg(not(unix))]
    let shutdown = std::future::pending::<Result<(), std::io::Error>>();

    tokio::select! {
        _ = reader_task => Ok(ExitReason::Completed),
        _ = stdin_task => Ok(ExitReason::Completed),
        _ = tokio::signal::ctrl_c() => {
            println!("exiting");
            Ok(ExitReason::Signal)
        }
        _ = shutdown => {
            println!("exiting");
            Ok(ExitReason::Signal)
        }
    }
}

async fn writer_task(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn handle_server_frame(line: &str, state: &Rc<RefCell<ClientState>>, outbound: &Outbound) {
    let frame = decode_frame(line);
    match frame.operator {
        Operator::ChooseName => println!("choose a username:"),
        Operator::NameRejected => println!("that name is taken, choose another:"),
        Operator::NameAccepted => {
            let name = frame.payload.unwrap_or_default();
            println!("OK! your name is {name}");
            println!("commands: get_statistic | ban_user NAME | change_chat channel|private NAME | anything else is a message");
            let mut s = state.borrow_mut();
            s.own_name = Some(name);
            s.name_chosen = true;
        }
        Operator::ChangeChat => {
            let Some(payload) = frame.payload else { return };
            match payload.parse::<Destination>() {
                Ok(dest) => {
                    println!("now viewing {} {}", dest.type_str(), dest.name());
                    state.borrow_mut().current_scope = dest;
                }
                Err(e) => warn!("malformed change_chat payload from server: {e}"),
            }
        }
        Operator::SetStatistic => {
            let Some(payload) = frame.payload else { return };
            match serde_json::from_str::<Statistics>(&payload) {
                Ok(stats) => {
                    println!("--- users: {} ---", stats.users.join(", "));
                    println!("--- channels: {} ---", stats.channels.join(", "));
                }
                Err(e) => warn!("malformed set_statistic payload: {e}"),
            }
        }
        Operator::MessageFromSrv => handle_message_from_srv(frame.payload.as_deref(), state, outbound),
        Operator::Unknown(_) => println!("{line}"),
        other => warn!("unexpected operator `{other}` from server"),
    }
}

fn handle_message_from_srv(payload: Option<&str>, state: &Rc<RefCell<ClientState>>, outbound: &Outbound) {
    let Some(payload) = payload else { return };
    let msg: WireMessage = match serde_json::from_str(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("malformed message_from_srv payload: {e}");
            return;
        }
    };

    let destination = match msg.destination_type.as_str() {
        crate::protocol::CHANNEL => Destination::Channel(msg.destination_name.clone()),
        crate::protocol::PRIVATE => Destination::Private(msg.destination_name.clone()),
        other => {
            warn!("message_from_srv with unknown destination_type `{other}`");
            return;
        }
    };

    let (matches, own_name) = {
        let s = state.borrow();
        (
            destination_matches_scope(&destination, &s.current_scope, s.own_name.as_deref()),
            s.own_name.clone(),
        )
    };
    if !matches {
        return;
    }

    println!("[{}] {}", msg.creator, msg.message);

    if let Some(user) = own_name {
        let approval = ApprovalPayload { uuid: msg.uuid, user };
        if let Ok(payload) = serde_json::to_string(&approval) {
            let _ = outbound.send(encode_frame(Operator::MessageApprove, Some(&payload)));
        }
    }
}

fn handle_user_input(line: &str, state: &Rc<RefCell<ClientState>>, outbound: &Outbound) {
    let name_chosen = state.borrow().name_chosen;
    if !name_chosen {
        let _ = outbound.send(format!("{line}\n"));
        return;
    }

    let trimmed = line.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let command = parts.next().unwrap_or("");
    let rest = parts.next();

    match command {
        "change_chat" => match rest.and_then(|r| r.parse::<Destination>().ok()) {
            Some(_) => {
                let _ = outbound.send(encode_frame(Operator::ChangeChat, rest));
            }
            None => println!("usage: change_chat channel|private NAME"),
        },
        "get_statistic" => {
            let _ = outbound.send(encode_frame(Operator::GetStatistic, None));
        }
        "ban_user" => {
            let _ = outbound.send(encode_frame(Operator::BanUser, rest));
        }
        _ => {
            let _ = outbound.send(encode_frame(Operator::MessageFromClient, Some(line)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_accepted_updates_state_and_prompts_commands() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_server_frame("name_accepted alice\n", &state, &tx);
        assert_eq!(state.borrow().own_name.as_deref(), Some("alice"));
        assert!(state.borrow().name_chosen);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn message_from_srv_outside_scope_is_silently_dropped() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        state.borrow_mut().own_name = Some("alice".to_string());
        state.borrow_mut().name_chosen = true;

        let msg = WireMessage {
            uuid: uuid::Uuid::new_v4().to_string(),
            creator: "bob".to_string(),
            destination_type: "channel".to_string(),
            destination_name: "random".to_string(),
            message: "hi".to_string(),
        };
        let payload = serde_json::to_string(&msg).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_message_from_srv(Some(&payload), &state, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn message_from_srv_in_scope_acknowledges() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        state.borrow_mut().own_name = Some("alice".to_string());
        state.borrow_mut().name_chosen = true;

        let msg = WireMessage {
            uuid: uuid::Uuid::new_v4().to_string(),
            creator: "bob".to_string(),
            destination_type: "channel".to_string(),
            destination_name: "general".to_string(),
            message: "hi".to_string(),
        };
        let payload = serde_json::to_string(&msg).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_message_from_srv(Some(&payload), &state, &tx);
        let sent = rx.try_recv().unwrap();
        assert!(sent.starts_with("message_approve "));
    }

    #[test]
    fn user_input_before_name_chosen_is_sent_raw() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_user_input("alice", &state, &tx);
        assert_eq!(rx.try_recv().unwrap(), "alice\n");
    }

    #[test]
    fn free_text_wraps_as_message_from_client() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        state.borrow_mut().name_chosen = true;
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_user_input("hello world", &state, &tx);
        assert_eq!(rx.try_recv().unwrap(), "message_from_client hello world\n");
    }

    #[test]
    fn change_chat_rejects_malformed_destination() {
        let state = Rc::new(RefCell::new(ClientState::new()));
        state.borrow_mut().name_chosen = true;
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_user_input("change_chat bogus", &state, &tx);
        assert!(rx.try_recv().is_err());
    }
}
