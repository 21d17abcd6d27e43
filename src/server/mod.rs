//! # Server Protocol Engine
//!
//! Owns the accept loop, per-connection state machine, delivery loop, and
//! periodic housekeeping that together make up the chat server. Everything
//! here runs on a single OS thread inside a [`tokio::task::LocalSet`]: the
//! shared pools are plain `Rc<RefCell<_>>`, and correctness rests on never
//! holding a borrow across an `.await` point (see [`engine`] for where that
//! matters).

pub mod delivery;
pub mod engine;
pub mod housekeeping;

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task;
use tracing::{info, warn};

use crate::connection::{ConnectionId, ConnectionPool};
use crate::limits::Limits;
use crate::message::MessagePool;
pub use crate::shutdown::ExitReason;

/// Shared handles threaded through every server-side task. Cloning a
/// `ServerState` is cheap: every field is a reference-counted handle or a
/// `Copy` value, never a deep copy of the pools themselves.
#[derive(Clone)]
pub struct ServerState {
    pub messages: Rc<RefCell<MessagePool>>,
    pub connections: Rc<RefCell<ConnectionPool>>,
    pub deliver_tx: tokio::sync::mpsc::UnboundedSender<(crate::message::MessageRecord, ConnectionId)>,
    pub limits: Limits,
}

/// Bind, wire up the shared pools, spawn the delivery loop and housekeeping
/// tasks, and accept connections until a shutdown signal arrives.
///
/// Must be run inside a [`tokio::task::LocalSet`] (via
/// [`tokio::task::LocalSet::run_until`]), since it and the tasks it spawns
/// use `spawn_local` and `Rc`-based shared state.
pub async fn run(limits: Limits, host: String, port: u16) -> Result<ExitReason> {
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    info!("chat server listening on {host}:{port}");
    run_on(limits, listener).await
}

/// Same as [`run`], but accepts an already-bound listener. Used by tests
/// that bind to port 0 and need to discover the assigned port before the
/// accept loop starts.
pub async fn run_on(limits: Limits, listener: TcpListener) -> Result<ExitReason> {
    let messages = Rc::new(RefCell::new(MessagePool::new()));
    let connections = Rc::new(RefCell::new(ConnectionPool::new()));
    let (deliver_tx, deliver_rx) = tokio::sync::mpsc::unbounded_channel();
    let next_id = Rc::new(Cell::new(1u64));

    let state = ServerState {
        messages: messages.clone(),
        connections: connections.clone(),
        deliver_tx,
        limits,
    };

    task::spawn_local(delivery::run(connections.clone(), deliver_rx));
    task::spawn_local(housekeeping::rate_limit_reset(connections.clone(), limits.rate_window));
    task::spawn_local(housekeeping::retention_sweep(messages.clone(), limits));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let shutdown = sigterm.recv();
        #[cfg(not(unix))]
        let shutdown = std::future::pending::<Option<()>>();

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr): (_, SocketAddr) = accepted?;
                let id = next_id.get();
                next_id.set(id + 1);
                let conn_state = state.clone();
                task::spawn_local(async move {
                    if let Err(e) = engine::handle_connection(id, stream, peer_addr, conn_state).await {
                        warn!("connection {id} ({peer_addr}) ended with error: {e:#}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                return Ok(ExitReason::Signal);
            }
            _ = shutdown => {
                info!("received termination signal, shutting down");
                return Ok(ExitReason::Signal);
            }
        }
    }
}
