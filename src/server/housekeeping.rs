//! Periodic housekeeping: rate-limit window resets and retention sweeps.
//!
//! Both run as their own `spawn_local`'d `tokio::time::interval` loops
//! rather than the tight busy-loop-with-sleep the original console tool
//! used — an artifact of that implementation, not a behavior worth
//! reproducing.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::connection::ConnectionPool;
use crate::limits::Limits;
use crate::message::MessagePool;

/// Reset every connection's rate-limit window counter once per `window`.
pub async fn rate_limit_reset(connections: Rc<RefCell<ConnectionPool>>, window: Duration) {
    let mut ticker = tokio::time::interval(window);
    ticker.tick().await; // first tick fires immediately; it's not a reset boundary
    loop {
        ticker.tick().await;
        connections.borrow_mut().clear_rate_windows();
        debug!("rate limit windows reset");
    }
}

/// Reap delivered messages past their retention window, once per
/// `limits.retention_sweep_interval`.
pub async fn retention_sweep(messages: Rc<RefCell<MessagePool>>, limits: Limits) {
    let mut ticker = tokio::time::interval(limits.retention_sweep_interval);
    loop {
        ticker.tick().await;
        let removed = messages.borrow_mut().reap_delivered(Utc::now(), limits.retention_chrono());
        if removed > 0 {
            debug!("retention sweep reaped {removed} message(s)");
        }
    }
}
