//! Error taxonomy for the ticket engine.
//!
//! # Invariants
//!
//! - An absent ticket and an expired ticket both surface as
//!   [`TicketError::NotFound`]; callers cannot tell which condition fired.
//! - Expiration and identity checks never produce errors; they return booleans.

use crate::types::TicketId;

/// Errors produced by registries, the codec and policy construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// The ticket does not exist, has expired, or is of a different kind.
    NotFound,
    /// The storage backend is unreachable or timed out. Retryable.
    StorageUnavailable(String),
    /// A stored record is corrupt or uses an unknown format/variant.
    Deserialization(String),
    /// The operation is forbidden by the ticket's current state.
    InvalidTicketState(String),
    /// Policy or configuration parameters are malformed.
    Configuration(String),
    /// The stored version changed between read and write.
    VersionConflict(TicketId),
    /// An in-process lock was poisoned by a panicking writer.
    LockPoisoned,
}

impl TicketError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::VersionConflict(_))
    }

    /// Whether the error means "ticket gone" (absent, expired or unreadable).
    #[must_use]
    pub const fn is_ticket_gone(&self) -> bool {
        matches!(self, Self::NotFound | Self::Deserialization(_))
    }
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "ticket not found"),
            Self::StorageUnavailable(reason) => write!(f, "storage unavailable: {reason}"),
            Self::Deserialization(reason) => write!(f, "deserialization error: {reason}"),
            Self::InvalidTicketState(reason) => write!(f, "invalid ticket state: {reason}"),
            Self::Configuration(reason) => write!(f, "configuration error: {reason}"),
            Self::VersionConflict(id) => write!(f, "version conflict on ticket {id}"),
            Self::LockPoisoned => write!(f, "registry lock poisoned"),
        }
    }
}

impl std::error::Error for TicketError {}

/// Errors surfaced by the ticket orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Creating or renewing a root ticket failed for a reason other than
    /// the existing ticket being gone.
    TicketCreation {
        /// The root ticket id the caller presented, if any.
        ticket_id: Option<String>,
        /// The underlying failure.
        source: TicketError,
    },
    /// Any other ticket operation failed.
    Ticket(TicketError),
}

impl OrchestratorError {
    /// Wrap a failure as a ticket-creation failure for `ticket_id`.
    pub(crate) fn creation(ticket_id: Option<&str>, source: TicketError) -> Self {
        Self::TicketCreation {
            ticket_id: ticket_id.map(str::to_string),
            source,
        }
    }
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TicketCreation {
                ticket_id: Some(id),
                source,
            } => write!(f, "failed to create ticket based on {id}: {source}"),
            Self::TicketCreation {
                ticket_id: None,
                source,
            } => write!(f, "failed to create ticket: {source}"),
            Self::Ticket(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TicketCreation { source, .. } => Some(source),
            Self::Ticket(e) => Some(e),
        }
    }
}

impl From<TicketError> for OrchestratorError {
    fn from(e: TicketError) -> Self {
        Self::Ticket(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_error_display() {
        assert_eq!(TicketError::NotFound.to_string(), "ticket not found");
        assert_eq!(
            TicketError::StorageUnavailable("timeout".to_string()).to_string(),
            "storage unavailable: timeout"
        );
        let conflict = TicketError::VersionConflict(TicketId::new("TGT-1-abc"));
        assert_eq!(conflict.to_string(), "version conflict on ticket TGT-1-abc");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TicketError::StorageUnavailable(String::new()).is_retryable());
        assert!(TicketError::VersionConflict(TicketId::new("TGT-1-a")).is_retryable());
        assert!(!TicketError::NotFound.is_retryable());
        assert!(!TicketError::Configuration(String::new()).is_retryable());
    }

    #[test]
    fn test_ticket_gone_classification() {
        assert!(TicketError::NotFound.is_ticket_gone());
        assert!(TicketError::Deserialization("bad crc".to_string()).is_ticket_gone());
        assert!(!TicketError::LockPoisoned.is_ticket_gone());
    }

    #[test]
    fn test_orchestrator_error_carries_original_id() {
        let error = OrchestratorError::creation(
            Some("TGT-9-xyz"),
            TicketError::StorageUnavailable("down".to_string()),
        );
        assert!(error.to_string().contains("TGT-9-xyz"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
