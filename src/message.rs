//! # Message Pool
//!
//! Holds every message posted to the service in memory, in insertion order,
//! and answers the filtered queries the protocol engine needs for replay
//! and history. At this scale (a handful of channels, short retention) a
//! linear scan per query is plenty fast and keeps the pool trivially easy
//! to reason about — no secondary indexes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{destination_matches_scope, encode_frame, Destination, Operator, WireMessage};

/// An immutable-after-construction chat message, plus the one piece of
/// mutable bookkeeping needed for retention: who has acknowledged it.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub creator: String,
    pub destination: Destination,
    pub body: String,
    /// Usernames that have acknowledged delivery. Deliberately not
    /// deduplicated: an acknowledgement that arrives twice for the same
    /// user is just recorded twice, matching the original service's v1
    /// behavior.
    pub received_users: Vec<String>,
}

impl MessageRecord {
    pub fn new(creator: String, destination: Destination, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            creator,
            destination,
            body,
            received_users: Vec::new(),
        }
    }

    /// Whether a connection sitting in `scope` (and, if named, `viewer_name`)
    /// should see this message.
    pub fn matches_scope(&self, scope: &Destination, viewer_name: Option<&str>) -> bool {
        destination_matches_scope(&self.destination, scope, viewer_name)
    }

    fn to_wire(&self) -> WireMessage {
        WireMessage {
            uuid: self.id.to_string(),
            creator: self.creator.clone(),
            destination_type: self.destination.type_str().to_string(),
            destination_name: self.destination.name().to_string(),
            message: self.body.clone(),
        }
    }

    /// Encode this record as a `message_from_srv` wire frame.
    pub fn encode(&self) -> String {
        let payload = serde_json::to_string(&self.to_wire()).unwrap_or_default();
        encode_frame(Operator::MessageFromSrv, Some(&payload))
    }
}

/// Filter keys for [`MessagePool::get_messages`]. Every field is optional;
/// an absent filter key places no constraint on the query, matching the
/// "omitted filters impose no constraint" behavior of the original filter
/// chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageFilter<'a> {
    pub destination: Option<&'a Destination>,
    pub creator: Option<&'a str>,
    pub not_from_creator: Option<&'a str>,
    pub not_received_user: Option<&'a str>,
}

/// The service's in-memory message store.
#[derive(Debug, Default)]
pub struct MessagePool {
    records: Vec<MessageRecord>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: MessageRecord) {
        self.records.push(record);
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&MessageRecord> {
        self.records.iter().find(|m| m.id == id)
    }

    /// Record that `user` has acknowledged message `id`. Returns `false` if
    /// no such message exists (already reaped, or a stale/forged uuid).
    pub fn mark_received(&mut self, id: Uuid, user: &str) -> bool {
        match self.records.iter_mut().find(|m| m.id == id) {
            Some(record) => {
                record.received_users.push(user.to_string());
                true
            }
            None => false,
        }
    }

    /// Every record created strictly before `now` that satisfies every
    /// filter key present in `filter`, in insertion order.
    pub fn get_messages(&self, now: DateTime<Utc>, filter: &MessageFilter<'_>) -> Vec<MessageRecord> {
        self.records
            .iter()
            .filter(|m| m.created_at < now)
            .filter(|m| filter.destination.map_or(true, |d| &m.destination == d))
            .filter(|m| filter.creator.map_or(true, |c| m.creator == c))
            .filter(|m| filter.not_from_creator.map_or(true, |c| m.creator != c))
            .filter(|m| {
                filter
                    .not_received_user
                    .map_or(true, |u| !m.received_users.iter().any(|x| x == u))
            })
            .cloned()
            .collect()
    }

    /// Drop every message that has been acknowledged by at least one
    /// recipient and is older than `retention`. Returns the number reaped.
    pub fn reap_delivered(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|m| !(!m.received_users.is_empty() && now - m.created_at > retention));
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(creator: &str, destination: Destination, body: &str) -> MessageRecord {
        MessageRecord::new(creator.to_string(), destination, body.to_string())
    }

    #[test]
    fn get_messages_applies_every_filter_key() {
        let mut pool = MessagePool::new();
        let general = Destination::Channel("general".to_string());
        pool.add(msg("alice", general.clone(), "hi"));
        pool.add(msg("bob", general.clone(), "yo"));

        let now = Utc::now() + chrono::Duration::seconds(1);
        let dest = general.clone();
        let filter = MessageFilter {
            destination: Some(&dest),
            not_from_creator: Some("alice"),
            ..Default::default()
        };
        let results = pool.get_messages(now, &filter);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].creator, "bob");
    }

    #[test]
    fn get_messages_excludes_future_records() {
        let mut pool = MessagePool::new();
        pool.add(msg("alice", Destination::general(), "hi"));
        let past = Utc::now() - chrono::Duration::seconds(10);
        let results = pool.get_messages(past, &MessageFilter::default());
        assert!(results.is_empty());
    }

    #[test]
    fn not_received_user_excludes_acknowledged_messages() {
        let mut pool = MessagePool::new();
        let record = msg("alice", Destination::general(), "hi");
        let id = record.id;
        pool.add(record);
        pool.mark_received(id, "bob");

        let now = Utc::now() + chrono::Duration::seconds(1);
        let filter = MessageFilter {
            not_received_user: Some("bob"),
            ..Default::default()
        };
        assert!(pool.get_messages(now, &filter).is_empty());

        let filter = MessageFilter {
            not_received_user: Some("carol"),
            ..Default::default()
        };
        assert_eq!(pool.get_messages(now, &filter).len(), 1);
    }

    #[test]
    fn reap_delivered_keeps_unacknowledged_and_fresh() {
        let mut pool = MessagePool::new();
        let old = msg("alice", Destination::general(), "old");
        let old_id = old.id;
        pool.add(old);
        pool.add(msg("bob", Destination::general(), "fresh, unacked"));
        pool.mark_received(old_id, "carol");

        let far_future = Utc::now() + chrono::Duration::minutes(120);
        let removed = pool.reap_delivered(far_future, chrono::Duration::minutes(60));
        assert_eq!(removed, 1);
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.get_by_id(old_id), None);
    }

    #[test]
    fn received_users_permits_duplicates() {
        let mut pool = MessagePool::new();
        let record = msg("alice", Destination::general(), "hi");
        let id = record.id;
        pool.add(record);
        pool.mark_received(id, "bob");
        pool.mark_received(id, "bob");
        assert_eq!(pool.get_by_id(id).unwrap().received_users, vec!["bob", "bob"]);
    }
}
