//! Ticket identifiers.
//!
//! Identifiers are opaque, type-prefixed strings such as
//! `TGT-17-pR3x...` for root session tickets and `ST-18-aQ9k...` for derived
//! tickets. The prefix lets the registry reject kind mismatches without
//! touching storage.
//!
//! # Invariants
//!
//! - An identifier never changes after creation.
//! - Generated identifiers are unique for the lifetime of the system: the
//!   process-local counter orders them and the random suffix separates
//!   processes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::distr::{Alphanumeric, SampleString};

/// Length of the random suffix in generated identifiers.
const RANDOM_SUFFIX_LENGTH: usize = 32;

/// The kind of a ticket, encoded in its identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketKind {
    /// A root session ticket.
    Root,
    /// A ticket derived from a root session ticket for one service.
    Derived,
}

impl TicketKind {
    /// The identifier prefix used for this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Root => "TGT",
            Self::Derived => "ST",
        }
    }

    /// Determine the kind from an identifier prefix.
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "TGT" => Some(Self::Root),
            "ST" => Some(Self::Derived),
            _ => None,
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root session ticket"),
            Self::Derived => write!(f, "derived ticket"),
        }
    }
}

/// A unique ticket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(String);

impl TicketId {
    /// Wrap an existing identifier string.
    ///
    /// No validation is performed; unknown prefixes simply never resolve.
    ///
    /// # Examples
    ///
    /// ```
    /// use tickets::types::{TicketId, TicketKind};
    /// let id = TicketId::new("TGT-1-abc");
    /// assert_eq!(id.kind(), Some(TicketKind::Root));
    /// ```
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind encoded in the prefix, if recognized.
    #[must_use]
    pub fn kind(&self) -> Option<TicketKind> {
        self.0
            .split_once('-')
            .and_then(|(prefix, _)| TicketKind::from_prefix(prefix))
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TicketId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Generates unique, type-prefixed ticket identifiers.
#[derive(Debug, Default)]
pub struct TicketIdGenerator {
    counter: AtomicU64,
}

impl TicketIdGenerator {
    /// Create a new generator with its counter at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Generate a new identifier for the given kind.
    pub fn next(&self, kind: TicketKind) -> TicketId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = Alphanumeric.sample_string(&mut rand::rng(), RANDOM_SUFFIX_LENGTH);
        TicketId(format!("{}-{sequence}-{suffix}", kind.prefix()))
    }
}
