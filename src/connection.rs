//! # Connection Pool
//!
//! Tracks every live connection: its negotiated username (if any), which
//! channel or private peer it is currently viewing, its rate-limit window,
//! and its ban/complaint state. A raw `TcpStream` can't be a `HashMap` key
//! or be cloned across tasks, so connections are identified by a
//! process-local [`ConnectionId`] instead; the actual handle used to push a
//! line to a peer is the [`Outbound`] sender stored alongside it.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::message::MessageRecord;
use crate::protocol::Destination;

/// Process-local, monotonically assigned connection identifier.
pub type ConnectionId = u64;

/// The write side of a connection's dedicated writer task. Sending a line
/// here queues it for delivery without blocking the caller or requiring an
/// `.await` while pool state is borrowed.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Per-connection state tracked by the server.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub outbound: Outbound,
    pub user_name: Option<String>,
    pub current_scope: Destination,
    pub msgs_sent_in_window: u32,
    /// Usernames that have filed a ban complaint against this connection.
    /// Not deduplicated — see [`crate::message::MessageRecord::received_users`]
    /// for the analogous v1 behavior on the message side.
    pub complainants: Vec<String>,
    pub ban_until: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, outbound: Outbound) -> Self {
        Self {
            id,
            outbound,
            user_name: None,
            current_scope: Destination::general(),
            msgs_sent_in_window: 0,
            complainants: Vec::new(),
            ban_until: None,
        }
    }

    /// Record a complaint from `by`. Once complaints reach `threshold`, the
    /// complaint list is cleared and a ban is set `ban_duration` from `now`.
    /// Returns whether this complaint triggered a ban.
    pub fn record_complaint(
        &mut self,
        by: &str,
        threshold: usize,
        ban_duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.complainants.push(by.to_string());
        if self.complainants.len() >= threshold {
            self.complainants.clear();
            self.ban_until = Some(now + ban_duration);
            true
        } else {
            false
        }
    }

    /// Whether this connection may post right now. Bans take priority over
    /// the rate limit; the rate limit only applies to posts into the
    /// default channel.
    pub fn can_post(&self, into_default_channel: bool, rate_limit: u32, now: DateTime<Utc>) -> Result<(), String> {
        if let Some(until) = self.ban_until {
            if until > now {
                return Err(format!(
                    "you are banned until {} and cannot send messages",
                    until.to_rfc2822()
                ));
            }
        }
        if into_default_channel && self.msgs_sent_in_window >= rate_limit {
            return Err(format!(
                "you have reached the limit of {rate_limit} messages for this window"
            ));
        }
        Ok(())
    }
}

/// The service's live-connection table.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: ConnectionRecord) {
        self.connections.insert(record.id, record);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord> {
        self.connections.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ConnectionRecord> {
        self.connections.values().find(|c| c.user_name.as_deref() == Some(name))
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut ConnectionRecord> {
        self.connections
            .values_mut()
            .find(|c| c.user_name.as_deref() == Some(name))
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.connections.values().any(|c| c.user_name.as_deref() == Some(name))
    }

    /// Every negotiated username, in no particular order.
    pub fn all_names(&self) -> Vec<String> {
        self.connections.values().filter_map(|c| c.user_name.clone()).collect()
    }

    /// Every distinct channel currently being viewed by at least one
    /// connection, sorted for stable output.
    pub fn all_channel_names(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .connections
            .values()
            .filter_map(|c| match &c.current_scope {
                Destination::Channel(name) => Some(name.clone()),
                Destination::Private(_) => None,
            })
            .collect();
        set.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionRecord)> {
        self.connections.iter()
    }

    /// Reset every connection's rate-limit window counter.
    pub fn clear_rate_windows(&mut self) {
        for conn in self.connections.values_mut() {
            conn.msgs_sent_in_window = 0;
        }
    }

    /// Broadcast-deliver `msg` directly to every connection (other than its
    /// sender) whose current scope matches, bypassing the replay queue.
    pub fn route(&self, msg: &MessageRecord, from_id: ConnectionId) {
        let frame = msg.encode();
        for (id, conn) in &self.connections {
            if *id == from_id {
                continue;
            }
            if msg.matches_scope(&conn.current_scope, conn.user_name.as_deref()) {
                let _ = conn.outbound.send(frame.clone());
            }
        }
    }
}
