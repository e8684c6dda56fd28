//! Test derived tickets: use limits, parent expiry and service binding.

use crate::e2e_tests::helpers::{Harness, SERVICE, START_MS, distributed, in_memory, password_login};
use crate::error::TicketError;
use crate::expiration::ExpirationPolicy;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;

/// Root tickets usable for five grants within one second.
fn five_grants() -> OrchestratorSettings {
    OrchestratorSettings {
        root_policy: ExpirationPolicy::MultiUseOrTimeout {
            max_uses: 5,
            time_to_kill_ms: 1_000,
        },
        derived_policy: ExpirationPolicy::NeverExpires,
        ..OrchestratorSettings::default()
    }
}

async fn root_exhausted_by_grants<R: TicketRegistry>(h: Harness<R>) {
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();

    let mut granted = Vec::new();
    for _ in 0..5 {
        granted.push(
            h.orchestrator
                .grant_derived_ticket(root.id(), SERVICE, None)
                .await
                .unwrap(),
        );
    }

    // Expired well before the one second lifetime.
    assert_eq!(
        h.orchestrator.grant_derived_ticket(root.id(), SERVICE, None).await,
        Err(TicketError::NotFound)
    );
    assert_eq!(h.registry.get_root(root.id()).await, Err(TicketError::NotFound));
    // Derived tickets die with their root.
    for derived in &granted {
        assert_eq!(h.registry.get_derived(derived.id()).await, Err(TicketError::NotFound));
    }
}

async fn unused_root_expires_by_time<R: TicketRegistry>(h: Harness<R>) {
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();

    h.clock.advance_ms(1_000);
    assert!(h.registry.get_root(root.id()).await.is_ok());

    h.clock.advance_ms(1);
    assert_eq!(h.registry.get_root(root.id()).await, Err(TicketError::NotFound));
}

async fn single_use_derived_ticket<R: TicketRegistry>(h: Harness<R>) {
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

    let authentication = h
        .orchestrator
        .validate_derived_ticket(derived.id(), SERVICE)
        .await
        .unwrap();
    assert_eq!(&authentication, root.authentication());

    assert_eq!(
        h.orchestrator.validate_derived_ticket(derived.id(), SERVICE).await,
        Err(TicketError::NotFound)
    );
}

async fn derived_ticket_times_out<R: TicketRegistry>(h: Harness<R>) {
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

    h.clock.advance_ms(10_001);
    assert_eq!(
        h.orchestrator.validate_derived_ticket(derived.id(), SERVICE).await,
        Err(TicketError::NotFound)
    );
    // The root ticket is unaffected.
    assert!(h.registry.get_root(root.id()).await.is_ok());
}

async fn wrong_service_burns_ticket<R: TicketRegistry>(h: Harness<R>) {
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

    assert!(matches!(
        h.orchestrator
            .validate_derived_ticket(derived.id(), "https://other.example.org")
            .await,
        Err(TicketError::InvalidTicketState(_))
    ));
    assert_eq!(
        h.orchestrator.validate_derived_ticket(derived.id(), SERVICE).await,
        Err(TicketError::NotFound)
    );
}

#[tokio::test]
async fn test_root_exhausted_by_grants() {
    root_exhausted_by_grants(in_memory(five_grants())).await;
    root_exhausted_by_grants(distributed(five_grants()).0).await;
}

#[tokio::test]
async fn test_root_exhausted_record_outlives_liveness() {
    let (h, cache) = distributed(five_grants());
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    for _ in 0..5 {
        h.orchestrator
            .grant_derived_ticket(root.id(), SERVICE, None)
            .await
            .unwrap();
    }

    // The physical TTL has not elapsed, yet the policy already says expired.
    let key = format!("e2e:ticket:{}", root.id());
    assert!(cache.physically_contains(&key));
    assert_eq!(h.registry.get_root(root.id()).await, Err(TicketError::NotFound));
}

#[tokio::test]
async fn test_unused_root_expires_by_time() {
    unused_root_expires_by_time(in_memory(five_grants())).await;
    unused_root_expires_by_time(distributed(five_grants()).0).await;
}

#[tokio::test]
async fn test_single_use_derived_ticket() {
    single_use_derived_ticket(in_memory(OrchestratorSettings::default())).await;
    single_use_derived_ticket(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test]
async fn test_derived_ticket_times_out() {
    derived_ticket_times_out(in_memory(OrchestratorSettings::default())).await;
    derived_ticket_times_out(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test]
async fn test_wrong_service_burns_ticket() {
    wrong_service_burns_ticket(in_memory(OrchestratorSettings::default())).await;
    wrong_service_burns_ticket(distributed(OrchestratorSettings::default()).0).await;
}
