//! Ticket entity model.
//!
//! Two concrete kinds share one [`TicketState`]:
//!
//! - [`RootSessionTicket`]: the long-lived session credential. Owns the
//!   [`Authentication`](crate::types::Authentication) and the list of
//!   descendant ticket ids.
//! - [`DerivedTicket`]: a short-lived credential for one service. Refers to
//!   its parent by id only; the parent is resolved through the registry and
//!   never owned.
//!
//! # Invariants
//!
//! - The ticket id never changes after construction.
//! - `use_count` only grows, by exactly one per recorded use.
//! - `version` is registry metadata: zero until stored, then whatever the
//!   backend assigned at the last successful write.

mod derived;
mod root;

pub use derived::DerivedTicket;
pub use root::{Descendant, RootSessionTicket};

use crate::expiration::ExpirationPolicy;
use crate::time::Clock;
use crate::types::{TicketId, TicketKind};

/// Temporal and usage state common to every ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketState {
    id: TicketId,
    created_at_ms: u64,
    last_used_ms: u64,
    previous_last_used_ms: u64,
    use_count: u64,
    expiration_policy: ExpirationPolicy,
    version: u64,
}

impl TicketState {
    /// Create fresh state for a ticket issued at `now_ms`.
    #[must_use]
    pub const fn new(id: TicketId, expiration_policy: ExpirationPolicy, now_ms: u64) -> Self {
        Self {
            id,
            created_at_ms: now_ms,
            last_used_ms: now_ms,
            previous_last_used_ms: now_ms,
            use_count: 0,
            expiration_policy,
            version: 0,
        }
    }

    /// Rebuild state read back from storage.
    pub(crate) const fn restore(
        id: TicketId,
        created_at_ms: u64,
        last_used_ms: u64,
        previous_last_used_ms: u64,
        use_count: u64,
        expiration_policy: ExpirationPolicy,
    ) -> Self {
        Self {
            id,
            created_at_ms,
            last_used_ms,
            previous_last_used_ms,
            use_count,
            expiration_policy,
            version: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TicketId {
        &self.id
    }

    #[must_use]
    pub const fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    #[must_use]
    pub const fn last_used_ms(&self) -> u64 {
        self.last_used_ms
    }

    #[must_use]
    pub const fn previous_last_used_ms(&self) -> u64 {
        self.previous_last_used_ms
    }

    #[must_use]
    pub const fn use_count(&self) -> u64 {
        self.use_count
    }

    #[must_use]
    pub const fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    /// The storage version this state was read at.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    pub(crate) const fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Record one use of the ticket at `now_ms`.
    pub const fn record_use(&mut self, now_ms: u64) {
        self.previous_last_used_ms = self.last_used_ms;
        self.last_used_ms = now_ms;
        self.use_count = self.use_count.saturating_add(1);
    }

    /// Whether the ticket's own policy reports it expired.
    #[must_use]
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        self.expiration_policy.is_expired(Some(self), clock)
    }

    /// Whether the ticket's own policy reports it expired at `now_ms`.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expiration_policy.is_expired_at(Some(self), now_ms)
    }

    /// The latest instant at which the ticket could still be live.
    #[must_use]
    pub fn maximum_expiration_ms(&self) -> Option<u64> {
        self.expiration_policy.maximum_expiration_ms(self)
    }
}

/// Any ticket the registry can hold.
///
/// Ticket state is read-only outside the crate; uses are only recorded by
/// the orchestrator.
///
/// ```compile_fail
/// use tickets::{Authentication, ExpirationPolicy, Principal, RootSessionTicket, Ticket, TicketId};
/// let mut ticket: Ticket = RootSessionTicket::new(
///     TicketId::new("TGT-1-abc"),
///     Authentication::new(Principal::new("casuser"), 0),
///     ExpirationPolicy::NeverExpires,
///     0,
/// )
/// .into();
/// ticket.state_mut().record_use(1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ticket {
    Root(RootSessionTicket),
    Derived(DerivedTicket),
}

impl Ticket {
    #[must_use]
    pub const fn state(&self) -> &TicketState {
        match self {
            Self::Root(root) => root.state(),
            Self::Derived(derived) => derived.state(),
        }
    }

    pub(crate) const fn state_mut(&mut self) -> &mut TicketState {
        match self {
            Self::Root(root) => root.state_mut(),
            Self::Derived(derived) => derived.state_mut(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &TicketId {
        self.state().id()
    }

    #[must_use]
    pub const fn kind(&self) -> TicketKind {
        match self {
            Self::Root(_) => TicketKind::Root,
            Self::Derived(_) => TicketKind::Derived,
        }
    }

    /// Whether the ticket's own policy reports it expired.
    ///
    /// For derived tickets this does not consider the parent; registries
    /// check parent liveness separately.
    #[must_use]
    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        self.state().is_expired(clock)
    }

    /// The principal owning a root ticket.
    #[must_use]
    pub fn principal_id(&self) -> Option<&str> {
        match self {
            Self::Root(root) => Some(root.authentication().principal.id.as_str()),
            Self::Derived(_) => None,
        }
    }

    #[must_use]
    pub fn into_root(self) -> Option<RootSessionTicket> {
        match self {
            Self::Root(root) => Some(root),
            Self::Derived(_) => None,
        }
    }

    #[must_use]
    pub fn into_derived(self) -> Option<DerivedTicket> {
        match self {
            Self::Derived(derived) => Some(derived),
            Self::Root(_) => None,
        }
    }
}

impl From<RootSessionTicket> for Ticket {
    fn from(root: RootSessionTicket) -> Self {
        Self::Root(root)
    }
}

impl From<DerivedTicket> for Ticket {
    fn from(derived: DerivedTicket) -> Self {
        Self::Derived(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use crate::types::{Authentication, Principal};

    #[test]
    fn test_record_use_tracks_previous() {
        let mut state = TicketState::new(
            TicketId::new("TGT-1-a"),
            ExpirationPolicy::NeverExpires,
            1000,
        );
        state.record_use(2000);
        state.record_use(3000);

        assert_eq!(state.use_count(), 2);
        assert_eq!(state.last_used_ms(), 3000);
        assert_eq!(state.previous_last_used_ms(), 2000);
        assert_eq!(state.created_at_ms(), 1000);
    }

    #[test]
    fn test_ticket_accessors() {
        let clock = ManualClock::new(1000);
        let root = RootSessionTicket::new(
            TicketId::new("TGT-1-a"),
            Authentication::new(Principal::new("casuser"), 1000),
            ExpirationPolicy::NeverExpires,
            1000,
        );
        let ticket = Ticket::from(root);

        assert_eq!(ticket.kind(), TicketKind::Root);
        assert_eq!(ticket.id().as_str(), "TGT-1-a");
        assert_eq!(ticket.principal_id(), Some("casuser"));
        assert!(!ticket.is_expired(&clock));
        assert!(ticket.clone().into_derived().is_none());
        assert!(ticket.into_root().is_some());
    }
}
