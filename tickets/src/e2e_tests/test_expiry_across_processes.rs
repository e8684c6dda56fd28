//! Test two distributed registries sharing one cache, as two server
//! processes would.

use futures::StreamExt;

use crate::e2e_tests::helpers::{SERVICE, START_MS, distributed, password_login, peer_registry};
use crate::error::TicketError;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;
use crate::ticket::Ticket;

#[tokio::test]
async fn test_ticket_issued_here_is_visible_there() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let peer = peer_registry(&h, &cache);

    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    let derived = h
        .orchestrator
        .grant_derived_ticket(root.id(), SERVICE, None)
        .await
        .unwrap();

    let seen = peer.get_root(root.id()).await.unwrap();
    assert_eq!(seen.authentication(), root.authentication());
    assert!(seen.has_descendant(derived.id()));
    assert_eq!(peer.get_derived(derived.id()).await.unwrap().service(), SERVICE);
}

#[tokio::test]
async fn test_expiry_seen_by_both() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let peer = peer_registry(&h, &cache);

    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    let derived = h
        .orchestrator
        .grant_derived_ticket(root.id(), SERVICE, None)
        .await
        .unwrap();

    // Past the derived lifetime but well inside the root's idle timeout.
    h.clock.advance_ms(10_001);
    assert_eq!(peer.get_derived(derived.id()).await, Err(TicketError::NotFound));
    assert_eq!(h.registry.get_derived(derived.id()).await, Err(TicketError::NotFound));
    assert!(peer.get_root(root.id()).await.is_ok());

    // Past the root's idle timeout the cache evicts the record itself.
    h.clock.advance_ms(8 * 60 * 60 * 1000);
    assert_eq!(peer.get_root(root.id()).await, Err(TicketError::NotFound));
    assert!(!cache.physically_contains(&format!("e2e:ticket:{}", root.id())));
}

#[tokio::test]
async fn test_logout_on_one_side_ends_session_on_other() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let peer = peer_registry(&h, &cache);

    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    let derived = h
        .orchestrator
        .grant_derived_ticket(root.id(), SERVICE, None)
        .await
        .unwrap();

    assert_eq!(peer.delete(root.id()).await.unwrap(), 2);
    assert_eq!(
        h.orchestrator.validate_derived_ticket(derived.id(), SERVICE).await,
        Err(TicketError::NotFound)
    );
    assert!(
        h.registry
            .sessions_for_principal("casuser", None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_stale_write_from_peer_conflicts() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let peer = peer_registry(&h, &cache);

    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    let stale = peer.get_root(root.id()).await.unwrap();

    h.orchestrator
        .grant_derived_ticket(root.id(), SERVICE, None)
        .await
        .unwrap();

    assert_eq!(
        peer.update(stale.into()).await,
        Err(TicketError::VersionConflict(root.id().clone()))
    );
}

#[tokio::test]
async fn test_queries_agree_across_processes() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let peer = peer_registry(&h, &cache);

    let first = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    h.clock.advance_ms(1_000);
    let second = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS + 1_000), None)
        .await
        .unwrap();
    h.orchestrator
        .create_or_update(password_login("other", START_MS + 1_000), None)
        .await
        .unwrap();

    let here = h.registry.sessions_for_principal("casuser", None).await.unwrap();
    let there = peer.sessions_for_principal("casuser", None).await.unwrap();
    assert_eq!(here, there);
    let ids: Vec<_> = there.iter().map(|root| root.id().clone()).collect();
    assert_eq!(ids, vec![first.id().clone(), second.id().clone()]);

    let recent = peer
        .sessions_for_principal("casuser", Some(START_MS + 1_000))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id(), second.id());

    let roots: Vec<Ticket> = peer
        .find(|ticket| matches!(ticket, Ticket::Root(_)))
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(roots.len(), 3);
    let count = h.registry.find(|_| true).count().await;
    assert_eq!(count, 3);
}
