//! Expiration policies.
//!
//! A policy is a pure predicate over a ticket's temporal and usage state and
//! the current time. Nothing is cached: asking twice with the same inputs
//! always gives the same answer, and the answer changes only because the
//! clock or the ticket state changed.
//!
//! The set of variants is closed. Each variant has an explicit, stable tag in
//! the codec (see [`crate::codec`]), so a record written by one process is
//! read back as the same variant by any other process of the deployment.
//!
//! # Variants
//!
//! | Variant | Expired when |
//! |---|---|
//! | `NeverExpires` | never |
//! | `Timeout` | idle for `time_to_kill`, or older than `max_time_to_live` if set |
//! | `MultiUseOrTimeout` | used `max_uses` times, or older than `time_to_kill` |
//! | `HardTimeout` | older than `time_to_kill` |
//! | `Throttled` | idle past `time_to_kill`, or reused within `time_in_between_uses` |

use std::time::Duration;

use crate::error::TicketError;
use crate::ticket::TicketState;
use crate::time::{Clock, duration_to_ms};

/// An expiration policy attached to a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationPolicy {
    /// The ticket never expires on its own.
    NeverExpires,
    /// Sliding idle timeout, optionally capped by a total lifetime.
    Timeout {
        /// Idle period after which the ticket expires.
        time_to_kill_ms: u64,
        /// Hard cap on the total lifetime, if any.
        max_time_to_live_ms: Option<u64>,
    },
    /// Expires after a number of uses or a fixed lifetime, whichever comes first.
    MultiUseOrTimeout {
        /// Number of uses after which the ticket expires.
        max_uses: u64,
        /// Lifetime measured from creation.
        time_to_kill_ms: u64,
    },
    /// Fixed lifetime measured from creation, regardless of use.
    HardTimeout {
        /// Lifetime measured from creation.
        time_to_kill_ms: u64,
    },
    /// Sliding idle timeout that also rejects rapid reuse.
    Throttled {
        /// Idle period after which the ticket expires.
        time_to_kill_ms: u64,
        /// Minimum spacing between two uses.
        time_in_between_uses_ms: u64,
    },
}

impl ExpirationPolicy {
    /// Sliding idle timeout.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` if `time_to_kill` is zero.
    pub fn timeout(time_to_kill: Duration) -> Result<Self, TicketError> {
        let policy = Self::Timeout {
            time_to_kill_ms: duration_to_ms(time_to_kill),
            max_time_to_live_ms: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Sliding idle timeout capped by a total lifetime.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` if either duration is zero or the
    /// idle timeout exceeds the lifetime.
    pub fn timeout_with_max_lifetime(
        time_to_kill: Duration,
        max_time_to_live: Duration,
    ) -> Result<Self, TicketError> {
        let policy = Self::Timeout {
            time_to_kill_ms: duration_to_ms(time_to_kill),
            max_time_to_live_ms: Some(duration_to_ms(max_time_to_live)),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Multi-use with a fixed lifetime.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` if `max_uses` or `time_to_kill` is zero.
    pub fn multi_use_or_timeout(max_uses: u64, time_to_kill: Duration) -> Result<Self, TicketError> {
        let policy = Self::MultiUseOrTimeout {
            max_uses,
            time_to_kill_ms: duration_to_ms(time_to_kill),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Fixed lifetime from creation.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` if `time_to_kill` is zero.
    pub fn hard_timeout(time_to_kill: Duration) -> Result<Self, TicketError> {
        let policy = Self::HardTimeout {
            time_to_kill_ms: duration_to_ms(time_to_kill),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Idle timeout with throttled reuse.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` if `time_to_kill` is zero or
    /// shorter than `time_in_between_uses`.
    pub fn throttled(
        time_to_kill: Duration,
        time_in_between_uses: Duration,
    ) -> Result<Self, TicketError> {
        let policy = Self::Throttled {
            time_to_kill_ms: duration_to_ms(time_to_kill),
            time_in_between_uses_ms: duration_to_ms(time_in_between_uses),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that the policy parameters are well formed.
    ///
    /// Used by the constructors and by the codec when reading stored policies.
    ///
    /// # Errors
    /// Returns `TicketError::Configuration` describing the first bad parameter.
    pub fn validate(&self) -> Result<(), TicketError> {
        let bad = |reason: &str| Err(TicketError::Configuration(format!("{}: {reason}", self.variant_name())));
        match *self {
            Self::NeverExpires => Ok(()),
            Self::Timeout {
                time_to_kill_ms,
                max_time_to_live_ms,
            } => {
                if time_to_kill_ms == 0 {
                    return bad("time to kill must be positive");
                }
                match max_time_to_live_ms {
                    Some(0) => bad("max time to live must be positive"),
                    Some(max) if max < time_to_kill_ms => {
                        bad("time to kill must not exceed max time to live")
                    }
                    _ => Ok(()),
                }
            }
            Self::MultiUseOrTimeout {
                max_uses,
                time_to_kill_ms,
            } => {
                if max_uses == 0 {
                    bad("number of uses must be positive")
                } else if time_to_kill_ms == 0 {
                    bad("time to kill must be positive")
                } else {
                    Ok(())
                }
            }
            Self::HardTimeout { time_to_kill_ms } => {
                if time_to_kill_ms == 0 {
                    bad("time to kill must be positive")
                } else {
                    Ok(())
                }
            }
            Self::Throttled {
                time_to_kill_ms,
                time_in_between_uses_ms,
            } => {
                if time_to_kill_ms == 0 {
                    bad("time to kill must be positive")
                } else if time_in_between_uses_ms > time_to_kill_ms {
                    bad("time in between uses must not exceed time to kill")
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Stable, human-readable name of the variant.
    #[must_use]
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::NeverExpires => "never-expires",
            Self::Timeout { .. } => "timeout",
            Self::MultiUseOrTimeout { .. } => "multi-use-or-timeout",
            Self::HardTimeout { .. } => "hard-timeout",
            Self::Throttled { .. } => "throttled",
        }
    }

    /// Whether the ticket is expired according to `clock`.
    ///
    /// A missing ticket is always expired.
    #[must_use]
    pub fn is_expired(&self, ticket: Option<&TicketState>, clock: &dyn Clock) -> bool {
        self.is_expired_at(ticket, clock.now_ms())
    }

    /// Whether the ticket is expired at `now_ms`.
    #[must_use]
    pub fn is_expired_at(&self, ticket: Option<&TicketState>, now_ms: u64) -> bool {
        let Some(ticket) = ticket else {
            return true;
        };
        let created = ticket.created_at_ms();
        let last_used = ticket.last_used_ms();

        match *self {
            Self::NeverExpires => false,
            Self::Timeout {
                time_to_kill_ms,
                max_time_to_live_ms,
            } => {
                let idle = now_ms.saturating_sub(last_used) >= time_to_kill_ms;
                let too_old = max_time_to_live_ms
                    .is_some_and(|max| now_ms.saturating_sub(created) >= max);
                idle || too_old
            }
            Self::MultiUseOrTimeout {
                max_uses,
                time_to_kill_ms,
            } => {
                let used_up = ticket.use_count() >= max_uses;
                let timed_out = now_ms > created.saturating_add(time_to_kill_ms);
                used_up || timed_out
            }
            Self::HardTimeout { time_to_kill_ms } => now_ms > created.saturating_add(time_to_kill_ms),
            Self::Throttled {
                time_to_kill_ms,
                time_in_between_uses_ms,
            } => {
                if now_ms > last_used.saturating_add(time_to_kill_ms) {
                    return true;
                }
                ticket.use_count() > 0 && now_ms < last_used.saturating_add(time_in_between_uses_ms)
            }
        }
    }

    /// Whether the ticket is expired for good at `now_ms`.
    ///
    /// Same as [`is_expired_at`](Self::is_expired_at), except that the
    /// `Throttled` reuse window, which passes with time, does not count.
    #[must_use]
    pub fn is_exhausted_at(&self, ticket: Option<&TicketState>, now_ms: u64) -> bool {
        match (*self, ticket) {
            (Self::Throttled { time_to_kill_ms, .. }, Some(ticket)) => {
                now_ms > ticket.last_used_ms().saturating_add(time_to_kill_ms)
            }
            _ => self.is_expired_at(ticket, now_ms),
        }
    }

    /// The latest instant at which the ticket could still be live.
    ///
    /// Used to bound physical TTLs in external stores so that a backend
    /// never evicts a record before this policy would. `None` means the
    /// ticket has no upper bound.
    #[must_use]
    pub fn maximum_expiration_ms(&self, ticket: &TicketState) -> Option<u64> {
        let created = ticket.created_at_ms();
        let last_used = ticket.last_used_ms();
        match *self {
            Self::NeverExpires => None,
            Self::Timeout {
                time_to_kill_ms,
                max_time_to_live_ms,
            } => {
                let idle_deadline = last_used.saturating_add(time_to_kill_ms);
                Some(max_time_to_live_ms.map_or(idle_deadline, |max| {
                    idle_deadline.min(created.saturating_add(max))
                }))
            }
            Self::MultiUseOrTimeout {
                time_to_kill_ms, ..
            }
            | Self::HardTimeout { time_to_kill_ms } => Some(created.saturating_add(time_to_kill_ms)),
            Self::Throttled {
                time_to_kill_ms, ..
            } => Some(last_used.saturating_add(time_to_kill_ms)),
        }
    }
}
