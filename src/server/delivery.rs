//! Replay delivery loop.
//!
//! History replay (on join and on `change_chat`) goes through this queue
//! instead of being written directly, so a connection catching up on a long
//! backlog yields between messages rather than flooding its writer task in
//! one synchronous burst. Live broadcast and private routing
//! ([`crate::connection::ConnectionPool::route`]) bypass this queue entirely
//! since those are single, already-current messages.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::task;

use crate::connection::{ConnectionId, ConnectionPool};
use crate::message::MessageRecord;

pub async fn run(connections: Rc<RefCell<ConnectionPool>>, mut rx: mpsc::UnboundedReceiver<(MessageRecord, ConnectionId)>) {
    while let Some((msg, target)) = rx.recv().await {
        let outbound = connections.borrow().get(target).map(|c| c.outbound.clone());
        if let Some(outbound) = outbound {
            let _ = outbound.send(msg.encode());
        }
        task::yield_now().await;
    }
}
