//! Ticket registries.
//!
//! A registry persists tickets and answers lookups. Two backends:
//!
//! - [`InMemoryTicketRegistry`]: one process, a `RwLock`-guarded map.
//! - [`DistributedTicketRegistry`]: any [`CacheClient`](crate::cache::CacheClient),
//!   shared by several processes.
//!
//! # Invariants
//!
//! - `get` never returns a ticket its expiration policy reports expired.
//! - A derived ticket is live only while its parent root ticket is live and
//!   still lists it among its descendants.
//! - `update` is a compare-and-swap on the ticket version. Concurrent
//!   read-modify-write cycles lose with [`TicketError::VersionConflict`]
//!   and must re-read.
//! - Deleting a root ticket deletes its descendants too.

mod distributed;
mod memory;
mod sweeper;

pub use distributed::{DistributedRegistrySettings, DistributedTicketRegistry};
pub use memory::InMemoryTicketRegistry;
pub use sweeper::{SweepConfig, spawn_sweeper};

use std::future::Future;

use futures::stream::BoxStream;

use crate::error::TicketError;
use crate::ticket::{DerivedTicket, RootSessionTicket, Ticket};
use crate::time::Clock;
use crate::types::{TicketId, TicketKind};

/// Storage for tickets.
///
/// Implementations are explicitly constructed and shared by `Arc`; there is
/// no global registry.
pub trait TicketRegistry: Send + Sync + 'static {
    /// Store a new ticket.
    ///
    /// Returns the stored ticket carrying the version assigned by the backend.
    ///
    /// # Errors
    ///
    /// - `InvalidTicketState` if a ticket with the same id is already stored
    /// - `StorageUnavailable` if the backend cannot be reached
    fn add(&self, ticket: Ticket) -> impl Future<Output = Result<Ticket, TicketError>> + Send;

    /// Fetch a live ticket of the expected kind.
    ///
    /// An expired ticket is reported as `NotFound` and removed best-effort.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the ticket is absent, expired, unreadable, or of
    ///   another kind
    /// - `StorageUnavailable` if the backend cannot be reached
    fn get(
        &self,
        id: &TicketId,
        expected_kind: TicketKind,
    ) -> impl Future<Output = Result<Ticket, TicketError>> + Send;

    /// Replace a stored ticket if its version still matches.
    ///
    /// # Errors
    ///
    /// - `VersionConflict` if the stored version differs from `ticket`'s
    /// - `NotFound` if no record exists
    /// - `StorageUnavailable` if the backend cannot be reached
    fn update(&self, ticket: Ticket) -> impl Future<Output = Result<Ticket, TicketError>> + Send;

    /// Delete a ticket, and its descendants for a root ticket.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend cannot be reached.
    fn delete(&self, id: &TicketId) -> impl Future<Output = Result<usize, TicketError>> + Send;

    /// Delete every ticket. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend cannot be reached.
    fn delete_all(&self) -> impl Future<Output = Result<usize, TicketError>> + Send;

    /// Stream the live tickets matching `predicate`.
    ///
    /// The stream is finite and reflects the registry at the time it is
    /// polled; calling `find` again starts over. Unreadable records are
    /// skipped.
    fn find<'a, P>(&'a self, predicate: P) -> BoxStream<'a, Result<Ticket, TicketError>>
    where
        P: Fn(&Ticket) -> bool + Send + Sync + 'a;

    /// Live root tickets of `principal_id`, oldest first.
    ///
    /// With `since_ms`, only tickets created at or after that instant.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend cannot be reached.
    fn sessions_for_principal(
        &self,
        principal_id: &str,
        since_ms: Option<u64>,
    ) -> impl Future<Output = Result<Vec<RootSessionTicket>, TicketError>> + Send;

    /// Fetch a live root session ticket.
    ///
    /// # Errors
    ///
    /// Same as [`TicketRegistry::get`].
    fn get_root(
        &self,
        id: &TicketId,
    ) -> impl Future<Output = Result<RootSessionTicket, TicketError>> + Send {
        async move {
            self.get(id, TicketKind::Root)
                .await?
                .into_root()
                .ok_or(TicketError::NotFound)
        }
    }

    /// Fetch a live derived ticket.
    ///
    /// # Errors
    ///
    /// Same as [`TicketRegistry::get`].
    fn get_derived(
        &self,
        id: &TicketId,
    ) -> impl Future<Output = Result<DerivedTicket, TicketError>> + Send {
        async move {
            self.get(id, TicketKind::Derived)
                .await?
                .into_derived()
                .ok_or(TicketError::NotFound)
        }
    }
}

/// Whether `ticket` is live, given its parent when it is a derived ticket.
///
/// `parent` is ignored for root tickets. A derived ticket whose parent is
/// missing, expired, or no longer lists it is not live.
pub(crate) fn is_live(ticket: &Ticket, parent: Option<&Ticket>, clock: &dyn Clock) -> bool {
    if ticket.is_expired(clock) {
        return false;
    }
    match ticket {
        Ticket::Root(_) => true,
        Ticket::Derived(derived) => match parent {
            Some(Ticket::Root(root)) => {
                !root.state().is_expired(clock) && root.has_descendant(derived.id())
            }
            _ => false,
        },
    }
}

/// Whether a root ticket satisfies a principal/creation-time query.
pub(crate) fn matches_principal(root: &RootSessionTicket, principal_id: &str, since_ms: Option<u64>) -> bool {
    root.authentication().principal.id == principal_id
        && since_ms.is_none_or(|since| root.state().created_at_ms() >= since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ExpirationPolicy;
    use crate::ticket::Descendant;
    use crate::time::ManualClock;
    use crate::tracking::SessionTrackingPolicy;
    use crate::types::{Authentication, Principal};

    fn root(policy: ExpirationPolicy) -> RootSessionTicket {
        RootSessionTicket::new(
            TicketId::new("TGT-1-a"),
            Authentication::new(Principal::new("casuser"), 1000),
            policy,
            1000,
        )
    }

    fn derived() -> DerivedTicket {
        DerivedTicket::new(
            TicketId::new("ST-1-a"),
            TicketId::new("TGT-1-a"),
            "https://app.example.org".to_string(),
            ExpirationPolicy::NeverExpires,
            1000,
        )
    }

    fn listing(mut parent: RootSessionTicket) -> RootSessionTicket {
        parent.record_grant(
            Descendant {
                id: TicketId::new("ST-1-a"),
                service: "https://app.example.org".to_string(),
                tracking_key: None,
            },
            SessionTrackingPolicy::TrackAll,
            1000,
        );
        parent
    }

    #[test]
    fn test_derived_needs_listing_parent() {
        let clock = ManualClock::new(1000);
        let ticket = Ticket::from(derived());

        assert!(!is_live(&ticket, None, &clock));

        let unlisted = Ticket::from(root(ExpirationPolicy::NeverExpires));
        assert!(!is_live(&ticket, Some(&unlisted), &clock));

        let parent = Ticket::from(listing(root(ExpirationPolicy::NeverExpires)));
        assert!(is_live(&ticket, Some(&parent), &clock));
    }

    #[test]
    fn test_derived_dies_with_expired_parent() {
        let clock = ManualClock::new(1000);
        let policy = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 10,
        };
        let parent = Ticket::from(listing(root(policy)));
        let ticket = Ticket::from(derived());

        assert!(is_live(&ticket, Some(&parent), &clock));
        clock.advance_ms(11);
        assert!(!is_live(&ticket, Some(&parent), &clock));
    }

    #[test]
    fn test_matches_principal_since() {
        let ticket = root(ExpirationPolicy::NeverExpires);

        assert!(matches_principal(&ticket, "casuser", None));
        assert!(matches_principal(&ticket, "casuser", Some(1000)));
        assert!(!matches_principal(&ticket, "casuser", Some(1001)));
        assert!(!matches_principal(&ticket, "other", None));
    }
}
