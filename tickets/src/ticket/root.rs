use crate::expiration::ExpirationPolicy;
use crate::ticket::TicketState;
use crate::tracking::SessionTrackingPolicy;
use crate::types::{Authentication, TicketId};

/// A derived ticket as remembered by its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descendant {
    /// Id of the derived ticket.
    pub id: TicketId,
    /// Service the derived ticket was granted for.
    pub service: String,
    /// Caller-supplied key used by [`SessionTrackingPolicy::MostRecentPerKey`].
    pub tracking_key: Option<String>,
}

/// The long-lived session credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSessionTicket {
    state: TicketState,
    authentication: Authentication,
    descendants: Vec<Descendant>,
}

impl RootSessionTicket {
    /// Create a root ticket issued at `now_ms`.
    #[must_use]
    pub const fn new(
        id: TicketId,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        now_ms: u64,
    ) -> Self {
        Self {
            state: TicketState::new(id, expiration_policy, now_ms),
            authentication,
            descendants: Vec::new(),
        }
    }

    pub(crate) const fn restore(
        state: TicketState,
        authentication: Authentication,
        descendants: Vec<Descendant>,
    ) -> Self {
        Self {
            state,
            authentication,
            descendants,
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
    pub const fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    /// Merge a newer authentication of the same subject.
    ///
    /// Does not count as a use: `use_count` and `last_used` stay unchanged.
    pub fn merge_authentication(&mut self, newer: &Authentication) {
        self.authentication.merge_from(newer);
    }

    #[must_use]
    pub fn descendants(&self) -> &[Descendant] {
        &self.descendants
    }

    /// Whether `id` is currently tracked as a descendant.
    #[must_use]
    pub fn has_descendant(&self, id: &TicketId) -> bool {
        self.descendants.iter().any(|descendant| &descendant.id == id)
    }

    /// Record the grant of a derived ticket.
    ///
    /// Counts one use, stamps `last_used`, and updates the descendant list
    /// through `tracking`. Returns the ids of descendants the tracking policy
    /// evicted; the caller is responsible for deleting them.
    pub fn record_grant(
        &mut self,
        descendant: Descendant,
        tracking: SessionTrackingPolicy,
        now_ms: u64,
    ) -> Vec<TicketId> {
        self.state.record_use(now_ms);
        tracking.track(&mut self.descendants, descendant)
    }

    /// Forget a descendant, returning whether it was tracked.
    pub fn remove_descendant(&mut self, id: &TicketId) -> bool {
        let before = self.descendants.len();
        self.descendants.retain(|descendant| &descendant.id != id);
        self.descendants.len() != before
    }
}
