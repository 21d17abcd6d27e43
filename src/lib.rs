//! # Line Chat
//!
//! A multi-user, line-protocol TCP chat service: clients negotiate a unique
//! username, then post to a shared default channel, switch into other
//! channels or private one-to-one conversations, check who's online, and
//! file complaints that accumulate into a temporary ban. The server
//! replays recent history to newly named connections and to connections
//! switching scope, and reaps delivered messages once they age out of the
//! retention window.

pub mod cli;
pub mod client;
pub mod connection;
pub mod limits;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use cli::{ClientArgs, ServerArgs};
pub use connection::{ConnectionId, ConnectionPool, ConnectionRecord};
pub use limits::Limits;
pub use message::{MessagePool, MessageRecord};
pub use protocol::{Destination, Operator};
pub use shutdown::ExitReason;

/// The current version of the chat service.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
