//! Per-connection state machine: name negotiation, then operator dispatch.
//!
//! Each accepted connection gets its own `spawn_local`'d task running
//! [`handle_connection`], plus a second dedicated writer task (see
//! [`writer_task`]) that owns the socket's write half and drains the
//! connection's `outbound` channel. Routing and replay only ever touch the
//! shared `Rc<RefCell<_>>` pools synchronously — no `.await` happens while a
//! borrow is held, which is what keeps the single-threaded, lock-free model
//! sound.

use std::net::SocketAddr;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ServerState;
use crate::connection::{ConnectionId, ConnectionRecord, Outbound};
use crate::message::{MessageFilter, MessageRecord};
use crate::protocol::{decode_frame, encode_frame, ApprovalPayload, Destination, Operator, Statistics};

enum Phase {
    AwaitName,
    Active,
}

/// Drive one connection end to end: register it, negotiate a name, then
/// dispatch operators until the peer disconnects.
pub async fn handle_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    state: ServerState,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    task::spawn_local(writer_task(write_half, outbound_rx));

    state.connections.borrow_mut().add(ConnectionRecord::new(id, outbound_tx.clone()));
    let _ = outbound_tx.send(encode_frame(Operator::ChooseName, None));
    debug!("connection {id} from {peer}: awaiting name");

    let mut phase = Phase::AwaitName;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("connection {id} read error: {e}");
                break;
            }
        };

        phase = match phase {
            Phase::AwaitName => {
                if handle_name_negotiation(id, &line, &state, &outbound_tx) {
                    Phase::Active
                } else {
                    Phase::AwaitName
                }
            }
            Phase::Active => {
                dispatch(id, &line, &state);
                Phase::Active
            }
        };
    }

    state.connections.borrow_mut().remove(id);
    debug!("connection {id} closed");
    Ok(())
}

/// Drain `rx` and write each line to the socket. Lives entirely outside the
/// shared pools so routing never has to `.await` a write.
async fn writer_task(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("writer task stopping: {e}");
            break;
        }
    }
}

/// Any inbound frame while `AWAIT_NAME` is treated as a raw candidate name,
/// not an operator frame. Returns whether the connection transitioned to
/// `ACTIVE`.
fn handle_name_negotiation(id: ConnectionId, line: &str, state: &ServerState, outbound: &Outbound) -> bool {
    let candidate = line.trim();
    if candidate.is_empty() {
        return false;
    }

    {
        let connections = state.connections.borrow();
        if connections.name_taken(candidate) {
            let _ = outbound.send(encode_frame(Operator::NameRejected, None));
            return false;
        }
    }

    {
        let mut connections = state.connections.borrow_mut();
        if let Some(conn) = connections.get_mut(id) {
            conn.user_name = Some(candidate.to_string());
        }
    }
    let _ = outbound.send(encode_frame(Operator::NameAccepted, Some(candidate)));

    // Unsolicited refresh so already-connected users see the updated roster
    // without polling.
    broadcast_statistics(state, Some(id));
    replay_history(id, state);
    true
}

fn dispatch(id: ConnectionId, line: &str, state: &ServerState) {
    let frame = decode_frame(line);
    match frame.operator {
        Operator::GetStatistic => handle_get_statistic(id, state),
        Operator::MessageApprove => handle_message_approve(frame.payload.as_deref(), state),
        Operator::ChangeChat => handle_change_chat(id, frame.payload.as_deref(), state),
        Operator::BanUser => handle_ban_user(id, frame.payload.as_deref(), state),
        Operator::MessageFromClient => handle_message_from_client(id, frame.payload.as_deref(), state),
        Operator::Unknown(op) => warn!("connection {id} sent unknown operator `{op}`, ignoring"),
        other => warn!("connection {id} sent unexpected operator `{other}` after name negotiation"),
    }
}

fn build_statistics(connections: &crate::connection::ConnectionPool) -> Statistics {
    Statistics {
        users: connections.all_names(),
        channels: connections.all_channel_names(),
    }
}

fn broadcast_statistics(state: &ServerState, except: Option<ConnectionId>) {
    let connections = state.connections.borrow();
    let stats = build_statistics(&connections);
    let Ok(payload) = serde_json::to_string(&stats) else { return };
    let frame = encode_frame(Operator::SetStatistic, Some(&payload));
    for (cid, conn) in connections.iter() {
        if conn.user_name.is_some() && Some(*cid) != except {
            let _ = conn.outbound.send(frame.clone());
        }
    }
}

fn handle_get_statistic(id: ConnectionId, state: &ServerState) {
    let connections = state.connections.borrow();
    let Some(conn) = connections.get(id) else { return };
    let stats = build_statistics(&connections);
    let Ok(payload) = serde_json::to_string(&stats) else { return };
    let _ = conn.outbound.send(encode_frame(Operator::SetStatistic, Some(&payload)));
}

fn handle_message_approve(payload: Option<&str>, state: &ServerState) {
    let Some(payload) = payload else {
        warn!("message_approve missing payload");
        return;
    };
    let approval: ApprovalPayload = match serde_json::from_str(payload) {
        Ok(a) => a,
        Err(e) => {
            warn!("message_approve malformed payload: {e}");
            return;
        }
    };
    let uuid = match Uuid::parse_str(&approval.uuid) {
        Ok(u) => u,
        Err(e) => {
            warn!("message_approve invalid uuid `{}`: {e}", approval.uuid);
            return;
        }
    };
    state.messages.borrow_mut().mark_received(uuid, &approval.user);
}

fn handle_change_chat(id: ConnectionId, payload: Option<&str>, state: &ServerState) {
    let Some(payload) = payload else {
        warn!("change_chat missing payload");
        return;
    };
    let destination: Destination = match payload.parse() {
        Ok(d) => d,
        Err(e) => {
            warn!("change_chat malformed payload `{payload}`: {e}");
            return;
        }
    };

    let (user_name, outbound) = {
        let mut connections = state.connections.borrow_mut();
        let Some(conn) = connections.get_mut(id) else { return };
        conn.current_scope = destination.clone();
        (conn.user_name.clone(), conn.outbound.clone())
    };
    let Some(user_name) = user_name else { return };

    let _ = outbound.send(encode_frame(Operator::ChangeChat, Some(payload)));

    let now = Utc::now();
    let msgs = {
        let messages = state.messages.borrow();
        match &destination {
            Destination::Channel(name) => {
                let dest = Destination::Channel(name.clone());
                let filter = MessageFilter {
                    destination: Some(&dest),
                    not_from_creator: Some(&user_name),
                    not_received_user: Some(&user_name),
                    ..Default::default()
                };
                messages.get_messages(now, &filter)
            }
            Destination::Private(other) => {
                let dest = Destination::Private(user_name.clone());
                let filter = MessageFilter {
                    destination: Some(&dest),
                    creator: Some(other),
                    not_from_creator: Some(&user_name),
                    not_received_user: Some(&user_name),
                    ..Default::default()
                };
                messages.get_messages(now, &filter)
            }
        }
    };

    for m in msgs {
        let _ = state.deliver_tx.send((m, id));
    }
}

fn handle_ban_user(id: ConnectionId, payload: Option<&str>, state: &ServerState) {
    let Some(target_name) = payload.map(str::trim).filter(|n| !n.is_empty()) else {
        warn!("ban_user missing target name");
        return;
    };

    let complainant = {
        let connections = state.connections.borrow();
        connections.get(id).and_then(|c| c.user_name.clone())
    };
    let Some(complainant) = complainant else { return };

    let mut connections = state.connections.borrow_mut();
    let Some(target) = connections.get_by_name_mut(target_name) else {
        warn!("ban_user: no such user `{target_name}`");
        return;
    };

    let now = Utc::now();
    let banned = target.record_complaint(&complainant, state.limits.complaint_threshold, state.limits.ban_duration_chrono(), now);
    if banned {
        let until = target.ban_until.expect("set by record_complaint when it returns true");
        let notice = format!("you have been banned until {} for repeated complaints\n", until.to_rfc2822());
        let _ = target.outbound.send(notice);
    }
}

fn handle_message_from_client(id: ConnectionId, payload: Option<&str>, state: &ServerState) {
    let Some(body) = payload else {
        warn!("message_from_client missing payload");
        return;
    };

    let (scope, outbound) = {
        let connections = state.connections.borrow();
        let Some(conn) = connections.get(id) else { return };
        (conn.current_scope.clone(), conn.outbound.clone())
    };
    let into_default = scope.is_default_channel();
    let now = Utc::now();

    {
        let connections = state.connections.borrow();
        let Some(conn) = connections.get(id) else { return };
        if let Err(reason) = conn.can_post(into_default, state.limits.rate_limit, now) {
            let _ = outbound.send(format!("{reason}\n"));
            return;
        }
    }

    let creator = {
        let mut connections = state.connections.borrow_mut();
        let Some(conn) = connections.get_mut(id) else { return };
        if into_default {
            conn.msgs_sent_in_window += 1;
        }
        conn.user_name.clone()
    };
    let Some(creator) = creator else { return };

    let record = MessageRecord::new(creator, scope, body.to_string());
    state.messages.borrow_mut().add(record.clone());
    state.connections.borrow().route(&record, id);
}

/// Replay history to a connection right after it names itself: all stored
/// messages, oldest first. Anything beyond the most recent
/// `limits.history_init` is marked received (so retention can still reap it)
/// without being resent.
fn replay_history(id: ConnectionId, state: &ServerState) {
    let user_name = {
        let connections = state.connections.borrow();
        connections.get(id).and_then(|c| c.user_name.clone())
    };
    let Some(user_name) = user_name else { return };

    let now = Utc::now();
    let history_init = state.limits.history_init;

    let mut messages = state.messages.borrow_mut();
    let all = messages.get_messages(now, &MessageFilter::default());
    let count = all.len();

    let to_replay = if count > history_init {
        let split = count - history_init;
        for old in &all[..split] {
            messages.mark_received(old.id, &user_name);
        }
        all[split..].to_vec()
    } else {
        all
    };
    drop(messages);

    for m in to_replay {
        let _ = state.deliver_tx.send((m, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionPool;
    use crate::limits::Limits;
    use crate::message::MessagePool;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_state() -> (ServerState, mpsc::UnboundedReceiver<(MessageRecord, ConnectionId)>) {
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let state = ServerState {
            messages: Rc::new(RefCell::new(MessagePool::new())),
            connections: Rc::new(RefCell::new(ConnectionPool::new())),
            deliver_tx,
            limits: Limits::default(),
        };
        (state, deliver_rx)
    }

    fn add_connection(state: &ServerState, id: ConnectionId, name: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut record = ConnectionRecord::new(id, tx);
        record.user_name = Some(name.to_string());
        state.connections.borrow_mut().add(record);
        rx
    }

    #[test]
    fn name_negotiation_rejects_duplicate_names() {
        let (state, _rx) = new_state();
        let mut outbound_rx = add_connection(&state, 1, "alice");
        // drain any statistics pushes that might already be queued
        while outbound_rx.try_recv().is_ok() {}

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        state.connections.borrow_mut().add(ConnectionRecord::new(2, tx2.clone()));
        let accepted = handle_name_negotiation(2, "alice", &state, &tx2);
        assert!(!accepted);
        let frame = rx2.try_recv().unwrap();
        assert_eq!(frame, "name_rejected\n");
    }

    #[test]
    fn name_negotiation_accepts_unique_name() {
        let (state, _rx) = new_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.connections.borrow_mut().add(ConnectionRecord::new(1, tx.clone()));
        let accepted = handle_name_negotiation(1, "alice", &state, &tx);
        assert!(accepted);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, "name_accepted alice\n");
    }

    #[test]
    fn message_from_client_routes_to_same_channel_peers() {
        let (state, _rx) = new_state();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let mut c1 = ConnectionRecord::new(1, tx1);
        c1.user_name = Some("alice".to_string());
        state.connections.borrow_mut().add(c1);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut c2 = ConnectionRecord::new(2, tx2);
        c2.user_name = Some("bob".to_string());
        state.connections.borrow_mut().add(c2);

        handle_message_from_client(1, Some("hello"), &state);

        let frame = rx2.try_recv().unwrap();
        assert!(frame.starts_with("message_from_srv "));
        assert_eq!(state.messages.borrow().count(), 1);
    }

    #[test]
    fn rate_limit_blocks_after_threshold_in_default_channel() {
        let (state, _rx) = new_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut c = ConnectionRecord::new(1, tx);
        c.user_name = Some("alice".to_string());
        c.msgs_sent_in_window = state.limits.rate_limit;
        state.connections.borrow_mut().add(c);

        handle_message_from_client(1, Some("hi"), &state);
        let frame = rx.try_recv().unwrap();
        assert!(frame.contains("limit"));
        assert_eq!(state.messages.borrow().count(), 0);
    }

    #[test]
    fn ban_user_triggers_after_threshold_complaints() {
        let (state, _rx) = new_state();
        let _r1 = add_connection(&state, 1, "alice");
        let _r2 = add_connection(&state, 2, "bob");
        let _r3 = add_connection(&state, 3, "carol");
        let mut rx_target = add_connection(&state, 4, "mallory");
        while rx_target.try_recv().is_ok() {}

        handle_ban_user(1, Some("mallory"), &state);
        handle_ban_user(2, Some("mallory"), &state);
        assert!(state.connections.borrow().get(4).unwrap().ban_until.is_none());

        handle_ban_user(3, Some("mallory"), &state);
        assert!(state.connections.borrow().get(4).unwrap().ban_until.is_some());
        let notice = rx_target.try_recv().unwrap();
        assert!(notice.contains("banned"));
    }
}
