//! # Wire Protocol Module
//!
//! Frames and parses the line-based protocol that connects chat clients and
//! the chat server. Each frame on the wire is a single line: an ASCII
//! operator token, optionally followed by a space and a payload, terminated
//! by `\n`. Payloads are either plain text or a JSON object, depending on
//! the operator.
//!
//! ## Closed Operator Set
//!
//! The operator is drawn from a fixed, closed set (see [`Operator`]). An
//! operator token outside that set is not a parse error: it decodes to
//! [`Operator::Unknown`] so that the server can log and ignore it and the
//! client can print the raw line, per the service's error-handling design.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The destination-type token for broadcast channel messages.
pub const CHANNEL: &str = "channel";
/// The destination-type token for private (peer-to-peer) messages.
pub const PRIVATE: &str = "private";
/// The only channel materialized in this version of the service.
pub const GENERAL: &str = "general";

/// Fixed set of wire operators.
///
/// Variants mirror the operator table in the protocol design exactly.
/// `Unknown` absorbs any token outside the closed set rather than failing
/// to parse, since an unrecognized operator must be tolerated (logged and
/// dropped on the server, echoed raw on the client) rather than treated as
/// a framing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    ChooseName,
    NameAccepted,
    NameRejected,
    GetStatistic,
    SetStatistic,
    MessageFromClient,
    MessageFromSrv,
    MessageApprove,
    ChangeChat,
    BanUser,
    /// An operator token outside the closed set, carrying the raw token.
    Unknown(String),
}

impl Operator {
    fn as_str(&self) -> &str {
        match self {
            Operator::ChooseName => "choose_name",
            Operator::NameAccepted => "name_accepted",
            Operator::NameRejected => "name_rejected",
            Operator::GetStatistic => "get_statistic",
            Operator::SetStatistic => "set_statistic",
            Operator::MessageFromClient => "message_from_client",
            Operator::MessageFromSrv => "message_from_srv",
            Operator::MessageApprove => "message_approve",
            Operator::ChangeChat => "change_chat",
            Operator::BanUser => "ban_user",
            Operator::Unknown(raw) => raw.as_str(),
        }
    }

    /// Parse an operator token. Never fails: unrecognized tokens become
    /// `Unknown` so callers can decide how to handle them.
    pub fn parse(token: &str) -> Self {
        match token {
            "choose_name" => Operator::ChooseName,
            "name_accepted" => Operator::NameAccepted,
            "name_rejected" => Operator::NameRejected,
            "get_statistic" => Operator::GetStatistic,
            "set_statistic" => Operator::SetStatistic,
            "message_from_client" => Operator::MessageFromClient,
            "message_from_srv" => Operator::MessageFromSrv,
            "message_approve" => Operator::MessageApprove,
            "change_chat" => Operator::ChangeChat,
            "ban_user" => Operator::BanUser,
            other => Operator::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded wire frame: operator plus optional payload.
///
/// Decoding never fails — see [`Operator::parse`] — so this is a plain
/// struct rather than a `Result`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub operator: Operator,
    pub payload: Option<String>,
}

/// Split a line into an operator and the remainder, exactly one space
/// after the operator token. The frame terminator (`\n`/`\r\n`) is
/// stripped first if present.
pub fn decode_frame(line: &str) -> Frame {
    let line = line.trim_end_matches(['\n', '\r']);
    match line.split_once(' ') {
        Some((op, rest)) => Frame {
            operator: Operator::parse(op),
            payload: Some(rest.to_string()),
        },
        None => Frame {
            operator: Operator::parse(line),
            payload: None,
        },
    }
}

/// Encode an operator and optional payload into a terminated wire line.
pub fn encode_frame(operator: Operator, payload: Option<&str>) -> String {
    match payload {
        Some(p) => format!("{operator} {p}\n"),
        None => format!("{operator}\n"),
    }
}

/// `Destination = Channel(name) | Private(name)`.
///
/// Collapses the wire's separate `destination_type`/`destination_name`
/// fields into one tagged variant, so routing predicates and filters reduce
/// to pattern matches instead of parallel string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Channel(String),
    Private(String),
}

impl Destination {
    /// The default channel every connection starts in.
    pub fn general() -> Self {
        Destination::Channel(GENERAL.to_string())
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Destination::Channel(_) => CHANNEL,
            Destination::Private(_) => PRIVATE,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Channel(n) | Destination::Private(n) => n,
        }
    }

    /// Whether this destination is the materialized default channel.
    pub fn is_default_channel(&self) -> bool {
        matches!(self, Destination::Channel(n) if n == GENERAL)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.type_str(), self.name())
    }
}

/// Error returned when a `<type> <name>` pair doesn't parse as a
/// [`Destination`].
#[derive(Debug)]
pub struct ParseDestinationError(pub String);

impl fmt::Display for ParseDestinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid destination `{}`, expected `channel NAME` or `private NAME`", self.0)
    }
}

impl std::error::Error for ParseDestinationError {}

impl FromStr for Destination {
    type Err = ParseDestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(2, ' ');
        let ty = parts.next().unwrap_or("");
        let name = parts.next().unwrap_or("").trim();
        if name.is_empty() {
            return Err(ParseDestinationError(s.to_string()));
        }
        match ty {
            CHANNEL => Ok(Destination::Channel(name.to_string())),
            PRIVATE => Ok(Destination::Private(name.to_string())),
            _ => Err(ParseDestinationError(s.to_string())),
        }
    }
}

/// The routing predicate shared by server-side delivery and client-side
/// display decisions, so the two never drift apart.
///
/// - A channel message is visible to a connection viewing that same channel.
/// - A private message is visible only to the connection whose own name is
///   the message's destination, while that connection is in private mode.
pub fn destination_matches_scope(
    destination: &Destination,
    scope: &Destination,
    viewer_name: Option<&str>,
) -> bool {
    match (destination, scope) {
        (Destination::Channel(dest_name), Destination::Channel(scope_name)) => dest_name == scope_name,
        (Destination::Private(dest_name), Destination::Private(_)) => Some(dest_name.as_str()) == viewer_name,
        _ => false,
    }
}

/// JSON shape of a delivered message (`message_from_srv` payload).
///
/// `received_users` and `created_at` are server-internal bookkeeping and are
/// never transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub uuid: String,
    pub creator: String,
    pub destination_type: String,
    pub destination_name: String,
    pub message: String,
}

/// JSON shape of the `set_statistic` payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Statistics {
    pub users: Vec<String>,
    pub channels: Vec<String>,
}

/// JSON shape of the `message_approve` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub uuid: String,
    pub user: String,
}
