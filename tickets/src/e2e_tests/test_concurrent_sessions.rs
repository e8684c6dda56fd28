//! Test concurrent renewals, replacements and validations.
//!
//! Each scenario races several spawned tasks against the same ticket id and
//! checks what survives once every task has finished.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::e2e_tests::helpers::{Harness, SERVICE, START_MS, distributed, in_memory, password_login};
use crate::error::TicketError;
use crate::expiration::ExpirationPolicy;
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;
use crate::ticket::RootSessionTicket;

const RACERS: usize = 16;

async fn renewals_merge_every_attribute<R: TicketRegistry>(h: Harness<R>) {
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();

    let handles: Vec<_> = (0..RACERS)
        .map(|i| {
            let orchestrator = Arc::clone(&h.orchestrator);
            let presented = root.id().as_str().to_string();
            tokio::spawn(async move {
                let login = password_login("casuser", START_MS)
                    .with_attribute(format!("attr-{i}"), vec![i.to_string()]);
                orchestrator.create_or_update(login, Some(&presented)).await
            })
        })
        .collect();

    for handle in handles {
        let renewed = handle.await.unwrap().unwrap();
        assert_eq!(renewed.id(), root.id());
    }

    let stored = h.registry.get_root(root.id()).await.unwrap();
    assert_eq!(stored.state().use_count(), 0);
    for i in 0..RACERS {
        assert_eq!(stored.authentication().attributes[&format!("attr-{i}")], vec![i.to_string()]);
    }
    assert_eq!(h.registry.sessions_for_principal("casuser", None).await.unwrap().len(), 1);
}

async fn renewals_race_replacement<R: TicketRegistry>(h: Harness<R>) {
    let alice = h
        .orchestrator
        .create_or_update(password_login("alice", START_MS), None)
        .await
        .unwrap();

    let spawn_login = |principal: &'static str| {
        let orchestrator = Arc::clone(&h.orchestrator);
        let presented = alice.id().as_str().to_string();
        tokio::spawn(async move {
            orchestrator
                .create_or_update(password_login(principal, START_MS), Some(&presented))
                .await
        })
    };
    let mut handles: Vec<_> = (0..RACERS / 2).map(|_| spawn_login("alice")).collect();
    handles.insert(RACERS / 4, spawn_login("bob"));

    let mut results: Vec<RootSessionTicket> = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    let bobs: Vec<_> = results
        .iter()
        .filter(|root| root.authentication().principal.id == "bob")
        .collect();
    assert_eq!(bobs.len(), 1);
    assert_ne!(bobs[0].id(), alice.id());

    // Alice either renewed before the replacement or got a fresh session
    // after it; the presented ticket itself never survives.
    let fresh_alice: BTreeSet<_> = results
        .iter()
        .filter(|root| root.authentication().principal.id == "alice" && root.id() != alice.id())
        .map(|root| root.id().clone())
        .collect();
    assert_eq!(h.registry.get_root(alice.id()).await, Err(TicketError::NotFound));
    assert_eq!(
        h.registry.sessions_for_principal("alice", None).await.unwrap().len(),
        fresh_alice.len()
    );
    assert_eq!(h.registry.sessions_for_principal("bob", None).await.unwrap().len(), 1);
}

async fn validations_honor_use_limit<R: TicketRegistry>(h: Harness<R>, max_uses: usize) {
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

    let handles: Vec<_> = (0..RACERS)
        .map(|_| {
            let orchestrator = Arc::clone(&h.orchestrator);
            let id = derived.id().clone();
            tokio::spawn(async move { orchestrator.validate_derived_ticket(&id, SERVICE).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(authentication) => {
                assert_eq!(&authentication, root.authentication());
                accepted += 1;
            }
            Err(e) => assert_eq!(e, TicketError::NotFound),
        }
    }
    assert_eq!(accepted, max_uses);
    assert_eq!(h.registry.get_derived(derived.id()).await, Err(TicketError::NotFound));
}

fn derived_uses(max_uses: u64) -> OrchestratorSettings {
    OrchestratorSettings {
        derived_policy: ExpirationPolicy::MultiUseOrTimeout {
            max_uses,
            time_to_kill_ms: 10_000,
        },
        ..OrchestratorSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_renewals_in_memory() {
    renewals_merge_every_attribute(in_memory(OrchestratorSettings::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_renewals_distributed() {
    renewals_merge_every_attribute(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_renewal_races_replacement_in_memory() {
    renewals_race_replacement(in_memory(OrchestratorSettings::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_renewal_races_replacement_distributed() {
    renewals_race_replacement(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_use_ticket_validates_once_in_memory() {
    validations_honor_use_limit(in_memory(derived_uses(1)), 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_use_ticket_validates_once_distributed() {
    validations_honor_use_limit(distributed(derived_uses(1)).0, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_use_ticket_validates_three_times() {
    validations_honor_use_limit(in_memory(derived_uses(3)), 3).await;
    validations_honor_use_limit(distributed(derived_uses(3)).0, 3).await;
}
