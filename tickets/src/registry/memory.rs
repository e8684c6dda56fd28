//! In-process ticket registry.
//!
//! # Concurrency Model
//!
//! One `RwLock` guards the whole map:
//! - Lookups take the read lock, clone what they need, and release it before
//!   evaluating expiration.
//! - Writes take the write lock. `update` compares versions under that lock,
//!   which makes it a compare-and-swap.
//!
//! Expired tickets are removed lazily by `get`, and in bulk by
//! [`InMemoryTicketRegistry::sweep_expired`] (see [`spawn_sweeper`](super::spawn_sweeper)).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, trace};

use crate::error::TicketError;
use crate::registry::{TicketRegistry, is_live, matches_principal};
use crate::ticket::{RootSessionTicket, Ticket};
use crate::time::Clock;
use crate::types::{TicketId, TicketKind};

/// Registry keeping tickets in process memory.
#[derive(Debug)]
pub struct InMemoryTicketRegistry {
    clock: Arc<dyn Clock>,
    tickets: RwLock<HashMap<TicketId, Ticket>>,
    next_version: AtomicU64,
}

impl InMemoryTicketRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tickets: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Number of records physically held, live or not.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a writer panicked.
    pub fn len(&self) -> Result<usize, TicketError> {
        Ok(self.read()?.len())
    }

    /// Whether the registry holds no records.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a writer panicked.
    pub fn is_empty(&self) -> Result<bool, TicketError> {
        Ok(self.read()?.is_empty())
    }

    /// Remove every ticket that is no longer live.
    ///
    /// Returns the number of records removed, descendants included.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a writer panicked.
    pub fn sweep_expired(&self) -> Result<usize, TicketError> {
        let mut tickets = self.write()?;
        let dead: Vec<TicketId> = tickets
            .values()
            .filter(|ticket| !Self::is_live_in(&tickets, ticket, self.clock.as_ref()))
            .map(|ticket| ticket.id().clone())
            .collect();

        let removed: usize = dead
            .iter()
            .map(|id| Self::remove_cascade(&mut tickets, id))
            .sum();
        drop(tickets);

        if removed > 0 {
            debug!(removed, "swept expired tickets");
        }
        Ok(removed)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TicketId, Ticket>>, TicketError> {
        self.tickets.read().map_err(|_| TicketError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TicketId, Ticket>>, TicketError> {
        self.tickets.write().map_err(|_| TicketError::LockPoisoned)
    }

    fn allocate_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn parent_of<'m>(tickets: &'m HashMap<TicketId, Ticket>, ticket: &Ticket) -> Option<&'m Ticket> {
        match ticket {
            Ticket::Derived(derived) => tickets.get(derived.parent_id()),
            Ticket::Root(_) => None,
        }
    }

    fn is_live_in(tickets: &HashMap<TicketId, Ticket>, ticket: &Ticket, clock: &dyn Clock) -> bool {
        is_live(ticket, Self::parent_of(tickets, ticket), clock)
    }

    /// Remove `id`, and the descendants it lists when it is a root ticket.
    fn remove_cascade(tickets: &mut HashMap<TicketId, Ticket>, id: &TicketId) -> usize {
        let Some(removed) = tickets.remove(id) else {
            return 0;
        };
        let descendants = match &removed {
            Ticket::Root(root) => root.descendants().iter().map(|d| d.id.clone()).collect(),
            Ticket::Derived(_) => Vec::new(),
        };
        1 + descendants
            .iter()
            .filter(|descendant| tickets.remove(descendant).is_some())
            .count()
    }

    /// Remove `id` if it still holds `version`.
    fn remove_stale(&self, id: &TicketId, version: u64) -> Result<usize, TicketError> {
        let mut tickets = self.write()?;
        if tickets.get(id).is_some_and(|ticket| ticket.state().version() == version) {
            return Ok(Self::remove_cascade(&mut tickets, id));
        }
        Ok(0)
    }
}

impl TicketRegistry for InMemoryTicketRegistry {
    async fn add(&self, mut ticket: Ticket) -> Result<Ticket, TicketError> {
        let mut tickets = self.write()?;
        if tickets.contains_key(ticket.id()) {
            return Err(TicketError::InvalidTicketState(format!(
                "ticket {} already exists",
                ticket.id()
            )));
        }
        ticket.state_mut().set_version(self.allocate_version());
        tickets.insert(ticket.id().clone(), ticket.clone());
        drop(tickets);

        trace!(ticket_id = %ticket.id(), "added ticket");
        Ok(ticket)
    }

    async fn get(&self, id: &TicketId, expected_kind: TicketKind) -> Result<Ticket, TicketError> {
        let (ticket, parent) = {
            let tickets = self.read()?;
            let Some(ticket) = tickets.get(id) else {
                return Err(TicketError::NotFound);
            };
            let parent = Self::parent_of(&tickets, ticket).cloned();
            (ticket.clone(), parent)
        };

        if ticket.kind() != expected_kind {
            return Err(TicketError::NotFound);
        }
        if !is_live(&ticket, parent.as_ref(), self.clock.as_ref()) {
            let removed = self.remove_stale(id, ticket.state().version())?;
            debug!(ticket_id = %id, removed, "ticket expired on read");
            return Err(TicketError::NotFound);
        }
        Ok(ticket)
    }

    async fn update(&self, mut ticket: Ticket) -> Result<Ticket, TicketError> {
        let mut tickets = self.write()?;
        let Some(stored) = tickets.get(ticket.id()) else {
            return Err(TicketError::NotFound);
        };
        if stored.state().version() != ticket.state().version() {
            return Err(TicketError::VersionConflict(ticket.id().clone()));
        }
        if stored.is_expired(self.clock.as_ref()) {
            let removed = Self::remove_cascade(&mut tickets, ticket.id());
            debug!(ticket_id = %ticket.id(), removed, "refused update of an expired ticket");
            return Err(TicketError::NotFound);
        }
        ticket.state_mut().set_version(self.allocate_version());
        tickets.insert(ticket.id().clone(), ticket.clone());
        Ok(ticket)
    }

    async fn delete(&self, id: &TicketId) -> Result<usize, TicketError> {
        let mut tickets = self.write()?;
        Ok(Self::remove_cascade(&mut tickets, id))
    }

    async fn delete_all(&self) -> Result<usize, TicketError> {
        let mut tickets = self.write()?;
        let removed = tickets.len();
        tickets.clear();
        Ok(removed)
    }

    fn find<'a, P>(&'a self, predicate: P) -> BoxStream<'a, Result<Ticket, TicketError>>
    where
        P: Fn(&Ticket) -> bool + Send + Sync + 'a,
    {
        stream::once(async move {
            let tickets = self.read()?;
            let mut live: Vec<Ticket> = tickets
                .values()
                .filter(|ticket| Self::is_live_in(&tickets, ticket, self.clock.as_ref()))
                .filter(|ticket| predicate(*ticket))
                .cloned()
                .collect();
            drop(tickets);
            live.sort_by(|a, b| a.id().cmp(b.id()));
            Ok::<_, TicketError>(live)
        })
        .flat_map(|snapshot| match snapshot {
            Ok(live) => stream::iter(live.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::iter(vec![Err(e)]).right_stream(),
        })
        .boxed()
    }

    async fn sessions_for_principal(
        &self,
        principal_id: &str,
        since_ms: Option<u64>,
    ) -> Result<Vec<RootSessionTicket>, TicketError> {
        let tickets = self.read()?;
        let mut sessions: Vec<RootSessionTicket> = tickets
            .values()
            .filter(|ticket| !ticket.is_expired(self.clock.as_ref()))
            .filter_map(|ticket| match ticket {
                Ticket::Root(root) => Some(root),
                Ticket::Derived(_) => None,
            })
            .filter(|root| matches_principal(root, principal_id, since_ms))
            .cloned()
            .collect();
        drop(tickets);

        sessions.sort_by_key(|root| root.state().created_at_ms());
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::expiration::ExpirationPolicy;
    use crate::ticket::{DerivedTicket, Descendant};
    use crate::time::ManualClock;
    use crate::tracking::SessionTrackingPolicy;
    use crate::types::{Authentication, Principal};

    fn registry() -> (Arc<ManualClock>, InMemoryTicketRegistry) {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = InMemoryTicketRegistry::new(clock.clone());
        (clock, registry)
    }

    fn root(id: &str, principal: &str, policy: ExpirationPolicy, now: u64) -> Ticket {
        RootSessionTicket::new(
            TicketId::new(id),
            Authentication::new(Principal::new(principal), now),
            policy,
            now,
        )
        .into()
    }

    /// Add a root with one listed derived ticket.
    async fn root_with_derived(registry: &InMemoryTicketRegistry) -> (TicketId, TicketId) {
        let mut parent = root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000)
            .into_root()
            .unwrap();
        parent.record_grant(
            Descendant {
                id: TicketId::new("ST-1-a"),
                service: "https://app.example.org".to_string(),
                tracking_key: None,
            },
            SessionTrackingPolicy::TrackAll,
            1_000,
        );
        registry.add(parent.into()).await.unwrap();
        let derived = DerivedTicket::new(
            TicketId::new("ST-1-a"),
            TicketId::new("TGT-1-a"),
            "https://app.example.org".to_string(),
            ExpirationPolicy::NeverExpires,
            1_000,
        );
        registry.add(derived.into()).await.unwrap();
        (TicketId::new("TGT-1-a"), TicketId::new("ST-1-a"))
    }

    #[tokio::test]
    async fn test_add_assigns_version() {
        let (_, registry) = registry();
        let stored = registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();
        assert!(stored.state().version() > 0);

        let fetched = registry.get(stored.id(), TicketKind::Root).await.unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_add_duplicate_rejected() {
        let (_, registry) = registry();
        let ticket = root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000);
        registry.add(ticket.clone()).await.unwrap();

        let result = registry.add(ticket).await;
        assert!(matches!(result, Err(TicketError::InvalidTicketState(_))));
    }

    #[tokio::test]
    async fn test_get_kind_mismatch_is_not_found() {
        let (_, registry) = registry();
        let stored = registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();

        let result = registry.get(stored.id(), TicketKind::Derived).await;
        assert_eq!(result, Err(TicketError::NotFound));
    }

    #[tokio::test]
    async fn test_expired_ticket_removed_on_read() {
        let (clock, registry) = registry();
        let policy = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        let stored = registry
            .add(root("TGT-1-a", "casuser", policy, 1_000))
            .await
            .unwrap();

        clock.advance_ms(101);
        assert_eq!(registry.get(stored.id(), TicketKind::Root).await, Err(TicketError::NotFound));
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let (_, registry) = registry();
        let stored = registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();

        let mut first = stored.clone();
        first.state_mut().record_use(2_000);
        let updated = registry.update(first).await.unwrap();
        assert!(updated.state().version() > stored.state().version());

        // A writer holding the old version loses.
        let mut second = stored;
        second.state_mut().record_use(3_000);
        assert!(matches!(
            registry.update(second).await,
            Err(TicketError::VersionConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_does_not_revive_expired_ticket() {
        let (clock, registry) = registry();
        let idle = ExpirationPolicy::Timeout {
            time_to_kill_ms: 100,
            max_time_to_live_ms: None,
        };
        let stored = registry.add(root("TGT-1-a", "casuser", idle, 1_000)).await.unwrap();

        clock.advance_ms(150);
        let mut revived = stored;
        revived.state_mut().record_use(clock.now_ms());
        assert_eq!(registry.update(revived).await, Err(TicketError::NotFound));
        assert!(registry.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_, registry) = registry();
        let ticket = root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000);
        assert_eq!(registry.update(ticket).await, Err(TicketError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_root_cascades() {
        let (_, registry) = registry();
        let (root_id, derived_id) = root_with_derived(&registry).await;

        assert!(registry.get(&derived_id, TicketKind::Derived).await.is_ok());
        assert_eq!(registry.delete(&root_id).await.unwrap(), 2);
        assert_eq!(registry.get(&derived_id, TicketKind::Derived).await, Err(TicketError::NotFound));
        assert_eq!(registry.delete(&root_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unlisted_derived_is_not_found() {
        let (_, registry) = registry();
        registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();
        let orphan = DerivedTicket::new(
            TicketId::new("ST-9-z"),
            TicketId::new("TGT-1-a"),
            "https://app.example.org".to_string(),
            ExpirationPolicy::NeverExpires,
            1_000,
        );
        registry.add(orphan.into()).await.unwrap();

        assert_eq!(
            registry.get(&TicketId::new("ST-9-z"), TicketKind::Derived).await,
            Err(TicketError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_find_only_live() {
        let (clock, registry) = registry();
        let short = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        registry.add(root("TGT-1-a", "alice", short, 1_000)).await.unwrap();
        registry
            .add(root("TGT-2-b", "bob", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();
        clock.advance_ms(500);

        let found: Vec<Ticket> = registry.find(|_| true).try_collect().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id().as_str(), "TGT-2-b");

        let none: Vec<Ticket> = registry
            .find(|ticket| ticket.principal_id() == Some("alice"))
            .try_collect()
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_for_principal() {
        let (_, registry) = registry();
        let never = ExpirationPolicy::NeverExpires;
        registry.add(root("TGT-1-a", "casuser", never, 1_000)).await.unwrap();
        registry.add(root("TGT-2-b", "casuser", never, 2_000)).await.unwrap();
        registry.add(root("TGT-3-c", "other", never, 2_000)).await.unwrap();

        let all = registry.sessions_for_principal("casuser", None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|root| root.id().as_str()).collect();
        assert_eq!(ids, vec!["TGT-1-a", "TGT-2-b"]);

        let recent = registry
            .sessions_for_principal("casuser", Some(1_500))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id().as_str(), "TGT-2-b");
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (clock, registry) = registry();
        let short = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        registry.add(root("TGT-1-a", "alice", short, 1_000)).await.unwrap();
        root_with_derived(&registry).await;

        assert_eq!(registry.sweep_expired().unwrap(), 0);
        clock.advance_ms(101);
        assert_eq!(registry.sweep_expired().unwrap(), 1);
        assert_eq!(registry.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (_, registry) = registry();
        root_with_derived(&registry).await;
        assert_eq!(registry.delete_all().await.unwrap(), 2);
        assert!(registry.is_empty().unwrap());
    }
}
