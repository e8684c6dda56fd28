//! Test the root ticket lifecycle: issue, renew, replace, logout.

use crate::e2e_tests::helpers::{Harness, SERVICE, START_MS, distributed, in_memory, password_login};
use crate::error::TicketError;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;
use crate::types::{TicketId, TicketKind};

async fn absent_id_issues_fresh_ticket<R: TicketRegistry>(h: Harness<R>) {
    let missing = "TGT-999-doesnotexist";
    let ticket = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), Some(missing))
        .await
        .unwrap();

    assert_ne!(ticket.id().as_str(), missing);
    assert_eq!(
        h.registry.get(&TicketId::new(missing), TicketKind::Root).await,
        Err(TicketError::NotFound)
    );
    assert!(h.registry.get(ticket.id(), TicketKind::Root).await.is_ok());
}

async fn same_identity_keeps_id<R: TicketRegistry>(h: Harness<R>) {
    let first = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    h.orchestrator
        .grant_derived_ticket(first.id(), SERVICE, None)
        .await
        .unwrap();
    let used = h.registry.get_root(first.id()).await.unwrap().state().use_count();
    assert_eq!(used, 1);

    h.clock.advance_ms(60_000);
    let again = password_login("casuser", START_MS + 60_000)
        .with_attribute("mfa", vec!["true".to_string()]);
    let renewed = h
        .orchestrator
        .create_or_update(again, Some(first.id().as_str()))
        .await
        .unwrap();

    assert_eq!(renewed.id(), first.id());
    assert_eq!(renewed.state().use_count(), used);
    assert_eq!(renewed.authentication().attributes["mfa"], vec!["true".to_string()]);
    assert_eq!(renewed.authentication().authenticated_at_ms, START_MS + 60_000);

    let stored = h.registry.get_root(first.id()).await.unwrap();
    assert_eq!(stored.authentication(), renewed.authentication());
}

async fn different_identity_replaces<R: TicketRegistry>(h: Harness<R>) {
    let alice = h
        .orchestrator
        .create_or_update(password_login("alice", START_MS), None)
        .await
        .unwrap();
    let derived = h
        .orchestrator
        .grant_derived_ticket(alice.id(), SERVICE, None)
        .await
        .unwrap();

    let bob = h
        .orchestrator
        .create_or_update(password_login("bob", START_MS), Some(alice.id().as_str()))
        .await
        .unwrap();

    assert_ne!(bob.id(), alice.id());
    assert_eq!(h.registry.get_root(alice.id()).await, Err(TicketError::NotFound));
    assert_eq!(h.registry.get_derived(derived.id()).await, Err(TicketError::NotFound));
    assert!(h.registry.sessions_for_principal("alice", None).await.unwrap().is_empty());
    assert_eq!(h.registry.sessions_for_principal("bob", None).await.unwrap().len(), 1);
}

async fn logout_destroys_everything<R: TicketRegistry>(h: Harness<R>) {
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    for _ in 0..3 {
        h.orchestrator
            .grant_derived_ticket(root.id(), SERVICE, None)
            .await
            .unwrap();
    }

    assert_eq!(h.orchestrator.destroy_session(root.id()).await.unwrap(), 4);
    let renewed = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), Some(root.id().as_str()))
        .await
        .unwrap();
    assert_ne!(renewed.id(), root.id());
}

#[tokio::test]
async fn test_absent_id_issues_fresh_ticket() {
    absent_id_issues_fresh_ticket(in_memory(OrchestratorSettings::default())).await;
    absent_id_issues_fresh_ticket(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test]
async fn test_same_identity_keeps_id() {
    same_identity_keeps_id(in_memory(OrchestratorSettings::default())).await;
    same_identity_keeps_id(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test]
async fn test_different_identity_replaces() {
    different_identity_replaces(in_memory(OrchestratorSettings::default())).await;
    different_identity_replaces(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test]
async fn test_logout_destroys_everything() {
    logout_destroys_everything(in_memory(OrchestratorSettings::default())).await;
    logout_destroys_everything(distributed(OrchestratorSettings::default()).0).await;
}
