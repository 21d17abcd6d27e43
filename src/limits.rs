//! Tunable thresholds governing rate limiting, bans, history replay, and
//! message retention. Mirrors the teacher's `BenchmarkConfiguration`: a
//! plain struct with spec-matching defaults, built from parsed CLI args via
//! [`Limits::from_server_args`].

use std::time::Duration;

use crate::cli::ServerArgs;

/// Runtime-tunable limits for the chat server.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// How many of the most recent stored messages a newly named connection
    /// is replayed in full; older ones are marked received without being
    /// resent.
    pub history_init: usize,
    /// Messages a connection may post to the default channel per rate
    /// window before being throttled.
    pub rate_limit: u32,
    /// How often the rate-limit window resets for every connection.
    pub rate_window: Duration,
    /// Complaints against a connection before it is banned.
    pub complaint_threshold: usize,
    /// How long a ban lasts once triggered.
    pub ban_duration: Duration,
    /// How long a delivered (acknowledged) message is kept before being
    /// reaped from the pool.
    pub retention: Duration,
    /// How often the retention sweep runs.
    pub retention_sweep_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            history_init: 20,
            rate_limit: 20,
            rate_window: Duration::from_secs(60 * 60),
            complaint_threshold: 3,
            ban_duration: Duration::from_secs(240 * 60),
            retention: Duration::from_secs(60 * 60),
            retention_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Limits {
    /// Chrono equivalent of [`Limits::ban_duration`], for arithmetic against
    /// `DateTime<Utc>`.
    pub fn ban_duration_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ban_duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Chrono equivalent of [`Limits::retention`].
    pub fn retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn from_server_args(args: &ServerArgs) -> Self {
        let defaults = Self::default();
        Self {
            history_init: args.history_init.unwrap_or(defaults.history_init),
            rate_limit: args.rate_limit.unwrap_or(defaults.rate_limit),
            rate_window: args.rate_window.unwrap_or(defaults.rate_window),
            complaint_threshold: args.complaint_threshold.unwrap_or(defaults.complaint_threshold),
            ban_duration: args.ban_duration.unwrap_or(defaults.ban_duration),
            retention: args.retention.unwrap_or(defaults.retention),
            retention_sweep_interval: args.retention_sweep_interval.unwrap_or(defaults.retention_sweep_interval),
        }
    }
}
