use crate::expiration::ExpirationPolicy;
use crate::ticket::TicketState;
use crate::types::TicketId;

/// A short-lived credential for one service, derived from a root session ticket.
///
/// The parent is referenced by id only. Resolving it (and treating this
/// ticket as expired once the parent is gone) is the registry's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedTicket {
    state: TicketState,
    parent_id: TicketId,
    service: String,
}

impl DerivedTicket {
    /// Create a derived ticket issued at `now_ms`.
    #[must_use]
    pub const fn new(
        id: TicketId,
        parent_id: TicketId,
        service: String,
        expiration_policy: ExpirationPolicy,
        now_ms: u64,
    ) -> Self {
        Self {
            state: TicketState::new(id, expiration_policy, now_ms),
            parent_id,
            service,
        }
    }

    pub(crate) const fn restore(state: TicketState, parent_id: TicketId, service: String) -> Self {
        Self {
            state,
            parent_id,
            service,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &TicketState {
        &self.state
    }

    pub(crate) const fn state_mut(&mut self) -> &mut TicketState {
        &mut self.state
    }

    #[must_use]
    pub const fn id(&self) -> &TicketId {
        self.state.id()
    }

    #[must_use]
    pub const fn parent_id(&self) -> &TicketId {
        &self.parent_id
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Record one validation of this ticket at `now_ms`.
    pub const fn record_use(&mut self, now_ms: u64) {
        self.state.record_use(now_ms);
    }
}
