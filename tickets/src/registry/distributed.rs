//! Ticket registry backed by a network cache.
//!
//! # Key Layout
//!
//! ```text
//! {namespace}:ticket:{ticket_id}            -> encoded ticket (codec envelope)
//! {namespace}:principal:{sha256(principal)} -> set of root ticket ids
//! ```
//!
//! Principal ids are hashed so they never appear in keys.
//!
//! # Consistency
//!
//! - Versions come from the cache; `update` is the cache's per-key
//!   compare-and-swap. There are no cross-key transactions.
//! - The physical TTL of a record is `maximum_expiration - now` at write
//!   time. It only bounds storage; liveness is always decided by the
//!   expiration policy on read.
//! - The principal index may list ids whose records are gone. Readers
//!   prune such members as they find them.
//! - Every cache call is bounded by `op_timeout`. A slow cache surfaces as
//!   `StorageUnavailable`, never as stale data.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, trace, warn};

use crate::cache::{CacheClient, CasOutcome, bounded};
use crate::codec::{decode_ticket, encode_ticket};
use crate::error::TicketError;
use crate::registry::{TicketRegistry, is_live, matches_principal};
use crate::ticket::{RootSessionTicket, Ticket};
use crate::time::Clock;
use crate::types::{TicketId, TicketKind, hash_principal_id};

/// Connection-independent settings of a distributed registry.
#[derive(Debug, Clone)]
pub struct DistributedRegistrySettings {
    /// Prefix shared by every key this registry writes.
    pub namespace: String,
    /// Upper bound on each cache call.
    pub op_timeout: Duration,
}

impl Default for DistributedRegistrySettings {
    fn default() -> Self {
        Self {
            namespace: "tickets".to_string(),
            op_timeout: Duration::from_secs(2),
        }
    }
}

/// Registry storing encoded tickets in a shared network cache.
#[derive(Debug)]
pub struct DistributedTicketRegistry<C: CacheClient> {
    cache: Arc<C>,
    clock: Arc<dyn Clock>,
    settings: DistributedRegistrySettings,
}

impl<C: CacheClient> DistributedTicketRegistry<C> {
    #[must_use]
    pub fn new(cache: Arc<C>, clock: Arc<dyn Clock>, settings: DistributedRegistrySettings) -> Self {
        Self {
            cache,
            clock,
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &DistributedRegistrySettings {
        &self.settings
    }

    fn ticket_prefix(&self) -> String {
        format!("{}:ticket:", self.settings.namespace)
    }

    fn ticket_key(&self, id: &TicketId) -> String {
        format!("{}{id}", self.ticket_prefix())
    }

    fn principal_key(&self, principal_id: &str) -> String {
        format!(
            "{}:principal:{}",
            self.settings.namespace,
            hash_principal_id(principal_id)
        )
    }

    /// Physical TTL for `ticket`, computed from its latest possible expiry.
    ///
    /// The record outlives that instant by one millisecond, since policies
    /// still accept a ticket exactly at its maximum expiration.
    fn ttl_for(&self, ticket: &Ticket) -> Option<Duration> {
        let maximum = ticket.state().maximum_expiration_ms()?;
        let remaining = maximum.saturating_sub(self.clock.now_ms()).saturating_add(1);
        Some(Duration::from_millis(remaining))
    }

    /// Read and decode a record, whatever its liveness.
    ///
    /// # Errors
    ///
    /// - `Deserialization` if the stored bytes cannot be decoded
    /// - `StorageUnavailable` if the cache cannot be reached
    async fn load(&self, id: &TicketId) -> Result<Option<Ticket>, TicketError> {
        let key = self.ticket_key(id);
        let Some(entry) = bounded("get", self.settings.op_timeout, self.cache.get(&key)).await? else {
            return Ok(None);
        };
        let mut ticket = decode_ticket(&entry.value)?;
        ticket.state_mut().set_version(entry.version);
        Ok(Some(ticket))
    }

    /// Load a record, treating an undecodable one as absent.
    async fn load_lenient(&self, id: &TicketId) -> Result<Option<Ticket>, TicketError> {
        match self.load(id).await {
            Err(TicketError::Deserialization(reason)) => {
                warn!(ticket_id = %id, %reason, "undecodable ticket record");
                Ok(None)
            }
            other => other,
        }
    }

    /// Load a record and check it is live, including its parent for
    /// derived tickets.
    async fn load_live(&self, id: &TicketId) -> Result<Option<Ticket>, TicketError> {
        let Some(ticket) = self.load_lenient(id).await? else {
            return Ok(None);
        };
        let parent = match &ticket {
            Ticket::Derived(derived) => self.load_lenient(derived.parent_id()).await?,
            Ticket::Root(_) => None,
        };
        if is_live(&ticket, parent.as_ref(), self.clock.as_ref()) {
            Ok(Some(ticket))
        } else {
            Ok(None)
        }
    }

    /// Delete a record and, for a root ticket, its descendants and its
    /// principal index entry.
    async fn remove(&self, id: &TicketId, ticket: Option<&Ticket>) -> Result<usize, TicketError> {
        let timeout = self.settings.op_timeout;
        let mut removed = usize::from(bounded("delete", timeout, self.cache.delete(&self.ticket_key(id))).await?);

        if let Some(Ticket::Root(root)) = ticket {
            for descendant in root.descendants() {
                let key = self.ticket_key(&descendant.id);
                removed += usize::from(bounded("delete", timeout, self.cache.delete(&key)).await?);
            }
            let index = self.principal_key(&root.authentication().principal.id);
            bounded("set_remove", timeout, self.cache.set_remove(&index, id.as_str())).await?;
        }
        Ok(removed)
    }

    /// Live root tickets listed in the index of `principal_id`.
    ///
    /// Members whose record is gone, expired or unreadable are removed from
    /// the index on the way.
    async fn live_sessions(&self, principal_id: &str) -> Result<Vec<RootSessionTicket>, TicketError> {
        let timeout = self.settings.op_timeout;
        let index = self.principal_key(principal_id);
        let members = bounded("set_members", timeout, self.cache.set_members(&index)).await?;

        let mut sessions = Vec::new();
        for member in members {
            let id = TicketId::new(member);
            match self.load_live(&id).await? {
                Some(Ticket::Root(root)) if root.authentication().principal.id == principal_id => {
                    sessions.push(root);
                }
                _ => {
                    trace!(ticket_id = %id, "pruning stale principal index entry");
                    bounded("set_remove", timeout, self.cache.set_remove(&index, id.as_str())).await?;
                }
            }
        }
        Ok(sessions)
    }

    /// Extend the index TTL of `principal_id` to cover a renewed root ticket.
    async fn refresh_index(&self, principal_id: &str, id: &TicketId, ttl: Option<Duration>) {
        let index = self.principal_key(principal_id);
        let refreshed = bounded(
            "set_add",
            self.settings.op_timeout,
            self.cache.set_add(&index, id.as_str(), ttl),
        )
        .await;
        if let Err(e) = refreshed {
            warn!(ticket_id = %id, error = %e, "failed to refresh principal index");
        }
    }

    /// Remove a record found dead on read. Failures are logged, not returned.
    async fn remove_best_effort(&self, id: &TicketId) {
        let ticket = self.load_lenient(id).await.ok().flatten();
        match self.remove(id, ticket.as_ref()).await {
            Ok(removed) => debug!(ticket_id = %id, removed, "removed dead ticket"),
            Err(e) => warn!(ticket_id = %id, error = %e, "failed to remove dead ticket"),
        }
    }
}

impl<C: CacheClient> TicketRegistry for DistributedTicketRegistry<C> {
    async fn add(&self, mut ticket: Ticket) -> Result<Ticket, TicketError> {
        let timeout = self.settings.op_timeout;
        let key = self.ticket_key(ticket.id());
        let ttl = self.ttl_for(&ticket);
        let bytes = encode_ticket(&ticket);

        let Some(version) =
            bounded("insert_if_absent", timeout, self.cache.insert_if_absent(&key, bytes, ttl)).await?
        else {
            return Err(TicketError::InvalidTicketState(format!(
                "ticket {} already exists",
                ticket.id()
            )));
        };
        ticket.state_mut().set_version(version);

        if let Some(principal_id) = ticket.principal_id() {
            let index = self.principal_key(principal_id);
            bounded(
                "set_add",
                timeout,
                self.cache.set_add(&index, ticket.id().as_str(), ttl),
            )
            .await?;
            if let Err(e) = self.live_sessions(principal_id).await {
                warn!(ticket_id = %ticket.id(), error = %e, "failed to prune principal index");
            }
        }

        trace!(ticket_id = %ticket.id(), version, "added ticket");
        Ok(ticket)
    }

    async fn get(&self, id: &TicketId, expected_kind: TicketKind) -> Result<Ticket, TicketError> {
        let ticket = match self.load(id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => return Err(TicketError::NotFound),
            Err(TicketError::Deserialization(reason)) => {
                warn!(ticket_id = %id, %reason, "undecodable ticket record");
                return Err(TicketError::NotFound);
            }
            Err(e) => return Err(e),
        };
        if ticket.kind() != expected_kind {
            return Err(TicketError::NotFound);
        }

        let parent = match &ticket {
            Ticket::Derived(derived) => self.load_lenient(derived.parent_id()).await?,
            Ticket::Root(_) => None,
        };
        if !is_live(&ticket, parent.as_ref(), self.clock.as_ref()) {
            debug!(ticket_id = %id, "ticket expired on read");
            self.remove_best_effort(id).await;
            return Err(TicketError::NotFound);
        }
        Ok(ticket)
    }

    async fn update(&self, mut ticket: Ticket) -> Result<Ticket, TicketError> {
        let key = self.ticket_key(ticket.id());
        let ttl = self.ttl_for(&ticket);
        let bytes = encode_ticket(&ticket);
        let expected = ticket.state().version();

        let outcome = bounded(
            "compare_and_swap",
            self.settings.op_timeout,
            self.cache.compare_and_swap(&key, expected, bytes, ttl),
        )
        .await?;

        match outcome {
            CasOutcome::Swapped { version } => {
                ticket.state_mut().set_version(version);
                if let Some(principal_id) = ticket.principal_id() {
                    self.refresh_index(principal_id, ticket.id(), ttl).await;
                }
                Ok(ticket)
            }
            CasOutcome::VersionMismatch => Err(TicketError::VersionConflict(ticket.id().clone())),
            CasOutcome::Missing => Err(TicketError::NotFound),
        }
    }

    async fn delete(&self, id: &TicketId) -> Result<usize, TicketError> {
        let ticket = self.load_lenient(id).await?;
        self.remove(id, ticket.as_ref()).await
    }

    async fn delete_all(&self) -> Result<usize, TicketError> {
        let timeout = self.settings.op_timeout;
        let keys = bounded("scan_prefix", timeout, self.cache.scan_prefix(&self.ticket_prefix())).await?;

        let mut removed = 0;
        for key in keys {
            let id = TicketId::new(key.trim_start_matches(&self.ticket_prefix()));
            if let Some(Ticket::Root(root)) = self.load_lenient(&id).await? {
                let index = self.principal_key(&root.authentication().principal.id);
                bounded("set_remove", timeout, self.cache.set_remove(&index, id.as_str())).await?;
            }
            removed += usize::from(bounded("delete", timeout, self.cache.delete(&key)).await?);
        }
        Ok(removed)
    }

    fn find<'a, P>(&'a self, predicate: P) -> BoxStream<'a, Result<Ticket, TicketError>>
    where
        P: Fn(&Ticket) -> bool + Send + Sync + 'a,
    {
        let predicate = Arc::new(predicate);
        let prefix = self.ticket_prefix();

        stream::once(async move {
            let keys = bounded("scan_prefix", self.settings.op_timeout, self.cache.scan_prefix(&prefix)).await;
            keys.map(|keys| (prefix, keys))
        })
        .flat_map(|scan| match scan {
            Ok((prefix, keys)) => stream::iter(
                keys.into_iter()
                    .map(move |key| Ok(TicketId::new(key.trim_start_matches(&prefix)))),
            )
            .left_stream(),
            Err(e) => stream::iter(vec![Err(e)]).right_stream(),
        })
        .filter_map(move |id| {
            let predicate = Arc::clone(&predicate);
            async move {
                let id = match id {
                    Ok(id) => id,
                    Err(e) => return Some(Err(e)),
                };
                match self.load_live(&id).await {
                    Ok(Some(ticket)) => (*predicate)(&ticket).then_some(Ok(ticket)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        })
        .boxed()
    }

    async fn sessions_for_principal(
        &self,
        principal_id: &str,
        since_ms: Option<u64>,
    ) -> Result<Vec<RootSessionTicket>, TicketError> {
        let mut sessions: Vec<RootSessionTicket> = self
            .live_sessions(principal_id)
            .await?
            .into_iter()
            .filter(|root| matches_principal(root, principal_id, since_ms))
            .collect();
        sessions.sort_by_key(|root| root.state().created_at_ms());
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::cache::{FaultConfig, InMemoryCache};
    use crate::expiration::ExpirationPolicy;
    use crate::ticket::{DerivedTicket, Descendant};
    use crate::time::ManualClock;
    use crate::tracking::SessionTrackingPolicy;
    use crate::types::{Authentication, Principal};

    struct Fixture {
        clock: Arc<ManualClock>,
        cache: Arc<InMemoryCache>,
        registry: DistributedTicketRegistry<InMemoryCache>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = Arc::new(InMemoryCache::new(clock.clone()));
        let registry = DistributedTicketRegistry::new(
            Arc::clone(&cache),
            clock.clone(),
            DistributedRegistrySettings::default(),
        );
        Fixture {
            clock,
            cache,
            registry,
        }
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

    #[tokio::test]
    async fn test_add_and_get() {
        let f = fixture();
        let stored = f
            .registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();

        let fetched = f.registry.get(stored.id(), TicketKind::Root).await.unwrap();
        assert_eq!(fetched, stored);
        assert!(f.cache.physically_contains("tickets:ticket:TGT-1-a"));
    }

    #[tokio::test]
    async fn test_physical_ttl_follows_maximum_expiration() {
        let f = fixture();
        let policy = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 5_000,
        };
        f.registry.add(root("TGT-1-a", "casuser", policy, 1_000)).await.unwrap();

        f.clock.advance_ms(5_000);
        assert!(f.cache.get("tickets:ticket:TGT-1-a").await.unwrap().is_some());
        f.clock.advance_ms(1);
        assert!(f.cache.get("tickets:ticket:TGT-1-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_conflict() {
        let f = fixture();
        let stored = f
            .registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();

        let mut first = stored.clone();
        first.state_mut().record_use(2_000);
        f.registry.update(first).await.unwrap();

        let mut stale = stored;
        stale.state_mut().record_use(3_000);
        assert!(matches!(
            f.registry.update(stale).await,
            Err(TicketError::VersionConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_not_found() {
        let f = fixture();
        f.registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();
        assert!(f.cache.overwrite_raw("tickets:ticket:TGT-1-a", vec![1, 2, 3, 4, 5, 6]));

        let result = f.registry.get(&TicketId::new("TGT-1-a"), TicketKind::Root).await;
        assert_eq!(result, Err(TicketError::NotFound));

        let found: Vec<Ticket> = f.registry.find(|_| true).try_collect().await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_delete_root_cascades_and_unindexes() {
        let f = fixture();
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
        f.registry.add(parent.into()).await.unwrap();
        let derived = DerivedTicket::new(
            TicketId::new("ST-1-a"),
            TicketId::new("TGT-1-a"),
            "https://app.example.org".to_string(),
            ExpirationPolicy::NeverExpires,
            1_000,
        );
        f.registry.add(derived.into()).await.unwrap();

        assert_eq!(f.registry.delete(&TicketId::new("TGT-1-a")).await.unwrap(), 2);
        assert_eq!(f.cache.physical_len(), 0);
        assert!(f.registry.sessions_for_principal("casuser", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_for_principal_prunes_index() {
        let f = fixture();
        let short = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        f.registry.add(root("TGT-1-a", "casuser", short, 1_000)).await.unwrap();
        f.registry
            .add(root("TGT-2-b", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();

        f.clock.advance_ms(101);
        let sessions = f.registry.sessions_for_principal("casuser", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id().as_str(), "TGT-2-b");

        let index = f.registry.principal_key("casuser");
        assert_eq!(f.cache.set_members(&index).await.unwrap(), vec!["TGT-2-b"]);
    }

    #[tokio::test]
    async fn test_principal_index_expires_with_its_sessions() {
        let f = fixture();
        let short = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        let longer = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 500,
        };
        f.registry.add(root("TGT-1-a", "casuser", short, 1_000)).await.unwrap();
        f.registry.add(root("TGT-2-b", "casuser", longer, 1_000)).await.unwrap();

        let index = f.registry.principal_key("casuser");
        f.clock.advance_ms(200);
        assert_eq!(f.cache.set_members(&index).await.unwrap().len(), 2);

        // Nobody queries the principal; the index still goes away.
        f.clock.advance_ms(301);
        assert!(f.cache.set_members(&index).await.unwrap().is_empty());
        assert_eq!(f.cache.physical_set_len(&index), 0);
        assert_eq!(f.cache.scan_prefix("").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_renewal_extends_principal_index() {
        let f = fixture();
        let idle = ExpirationPolicy::Timeout {
            time_to_kill_ms: 100,
            max_time_to_live_ms: None,
        };
        f.registry.add(root("TGT-1-a", "casuser", idle, 1_000)).await.unwrap();

        f.clock.advance_ms(90);
        let mut renewed = f.registry.get(&TicketId::new("TGT-1-a"), TicketKind::Root).await.unwrap();
        renewed.state_mut().record_use(f.clock.now_ms());
        f.registry.update(renewed).await.unwrap();

        f.clock.advance_ms(90);
        let sessions = f.registry.sessions_for_principal("casuser", None).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_add_prunes_dead_index_entries() {
        let f = fixture();
        let short = ExpirationPolicy::HardTimeout {
            time_to_kill_ms: 100,
        };
        f.registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await
            .unwrap();
        for i in 2..6 {
            f.registry
                .add(root(&format!("TGT-{i}-x"), "casuser", short, f.clock.now_ms()))
                .await
                .unwrap();
            f.clock.advance_ms(101);
        }

        let index = f.registry.principal_key("casuser");
        // Each add drops the sessions that died before it.
        assert_eq!(f.cache.physical_set_len(&index), 2);
    }

    #[tokio::test]
    async fn test_principal_key_is_hashed() {
        let f = fixture();
        let key = f.registry.principal_key("casuser");
        assert!(key.starts_with("tickets:principal:"));
        assert!(!key.contains("casuser"));
    }

    #[tokio::test]
    async fn test_unreachable_cache_is_storage_unavailable() {
        let f = fixture();
        f.cache.set_reachable(false);

        let result = f.registry.get(&TicketId::new("TGT-1-a"), TicketKind::Root).await;
        assert!(matches!(result, Err(TicketError::StorageUnavailable(_))));

        let result = f
            .registry
            .add(root("TGT-1-a", "casuser", ExpirationPolicy::NeverExpires, 1_000))
            .await;
        assert!(matches!(result, Err(TicketError::StorageUnavailable(_))));

        let found: Vec<Result<Ticket, TicketError>> = f.registry.find(|_| true).collect().await;
        assert!(matches!(found.as_slice(), [Err(TicketError::StorageUnavailable(_))]));
    }

    #[tokio::test]
    async fn test_slow_cache_times_out() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = Arc::new(InMemoryCache::with_faults(
            clock.clone(),
            0,
            FaultConfig::with_latency(Duration::from_millis(200)),
        ));
        let registry = DistributedTicketRegistry::new(
            cache,
            clock,
            DistributedRegistrySettings {
                namespace: "slow".to_string(),
                op_timeout: Duration::from_millis(20),
            },
        );

        let result = registry.get(&TicketId::new("TGT-1-a"), TicketKind::Root).await;
        assert!(matches!(result, Err(TicketError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn test_delete_all() {
        let f = fixture();
        let never = ExpirationPolicy::NeverExpires;
        f.registry.add(root("TGT-1-a", "alice", never, 1_000)).await.unwrap();
        f.registry.add(root("TGT-2-b", "bob", never, 1_000)).await.unwrap();

        assert_eq!(f.registry.delete_all().await.unwrap(), 2);
        assert_eq!(f.cache.physical_len(), 0);
        assert!(f.registry.sessions_for_principal("alice", None).await.unwrap().is_empty());
    }
}
