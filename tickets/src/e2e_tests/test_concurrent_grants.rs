//! Test concurrent derived-ticket grants on one root ticket.
//!
//! Every grant is a read-modify-write of the root; lost races retry, so no
//! grant is lost and no use is double counted.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::e2e_tests::helpers::{Harness, SERVICE, START_MS, distributed, in_memory, password_login};
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;
use crate::tracking::SessionTrackingPolicy;

const GRANTS: usize = 16;

/// Grant `GRANTS` derived tickets concurrently, the i-th with `key(i)`.
async fn grant_concurrently<R: TicketRegistry>(
    h: &Harness<R>,
    key: fn(usize) -> Option<String>,
) -> crate::types::TicketId {
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();

    let handles: Vec<_> = (0..GRANTS)
        .map(|i| {
            let orchestrator = Arc::clone(&h.orchestrator);
            let root_id = root.id().clone();
            tokio::spawn(async move {
                orchestrator
                    .grant_derived_ticket(&root_id, SERVICE, key(i).as_deref())
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    root.id().clone()
}

fn no_key(_: usize) -> Option<String> {
    None
}

fn device_key(i: usize) -> Option<String> {
    Some(format!("device-{}", i % 4))
}

async fn track_all_keeps_every_grant<R: TicketRegistry>(h: Harness<R>) {
    let root_id = grant_concurrently(&h, no_key).await;

    let root = h.registry.get_root(&root_id).await.unwrap();
    assert_eq!(root.state().use_count(), GRANTS as u64);
    assert_eq!(root.descendants().len(), GRANTS);

    for descendant in root.descendants() {
        assert!(h.registry.get_derived(&descendant.id).await.is_ok());
    }
}

async fn most_recent_keeps_one_per_key<R: TicketRegistry>(h: Harness<R>) {
    let root_id = grant_concurrently(&h, device_key).await;

    let root = h.registry.get_root(&root_id).await.unwrap();
    assert_eq!(root.state().use_count(), GRANTS as u64);

    let keys: BTreeSet<Option<String>> = root
        .descendants()
        .iter()
        .map(|descendant| descendant.tracking_key.clone())
        .collect();
    assert_eq!(root.descendants().len(), 4);
    assert_eq!(keys.len(), 4);
}

fn most_recent() -> OrchestratorSettings {
    OrchestratorSettings {
        tracking: SessionTrackingPolicy::MostRecentPerKey,
        ..OrchestratorSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_track_all_in_memory() {
    track_all_keeps_every_grant(in_memory(OrchestratorSettings::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_track_all_distributed() {
    track_all_keeps_every_grant(distributed(OrchestratorSettings::default()).0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_most_recent_per_key_in_memory() {
    most_recent_keeps_one_per_key(in_memory(most_recent())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_most_recent_per_key_distributed() {
    most_recent_keeps_one_per_key(distributed(most_recent()).0).await;
}
