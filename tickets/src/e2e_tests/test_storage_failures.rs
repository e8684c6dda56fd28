//! Test orchestrator behavior when the network cache misbehaves.

use std::time::Duration;

use crate::cache::FaultConfig;
use crate::e2e_tests::helpers::{SERVICE, START_MS, distributed, distributed_with_faults, password_login};
use crate::error::{OrchestratorError, TicketError};
use crate::orchestrator::OrchestratorSettings;
use crate::registry::TicketRegistry;

#[tokio::test]
async fn test_login_with_unreachable_cache() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    cache.set_reachable(false);

    let result = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::TicketCreation {
            ticket_id: None,
            source: TicketError::StorageUnavailable(_),
        })
    ));
}

#[tokio::test]
async fn test_renewal_with_unreachable_cache_keeps_id() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    cache.set_reachable(false);

    let result = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), Some(root.id().as_str()))
        .await;
    let Err(OrchestratorError::TicketCreation { ticket_id, source }) = result else {
        panic!("expected a ticket creation failure, got {result:?}");
    };
    assert_eq!(ticket_id.as_deref(), Some(root.id().as_str()));
    assert!(matches!(source, TicketError::StorageUnavailable(_)));

    // The session survives the outage.
    cache.set_reachable(true);
    assert!(h.registry.get_root(root.id()).await.is_ok());
}

#[tokio::test]
async fn test_slow_cache_times_out() {
    let (h, _cache) = distributed_with_faults(
        OrchestratorSettings::default(),
        FaultConfig::with_latency(Duration::from_millis(500)),
        Duration::from_millis(20),
    );

    let result = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::TicketCreation {
            source: TicketError::StorageUnavailable(_),
            ..
        })
    ));
}

#[tokio::test]
async fn test_flaky_cache_fails_cleanly() {
    let (h, cache) = distributed_with_faults(
        OrchestratorSettings::default(),
        FaultConfig {
            failure_rate: 0.5,
            latency: Duration::ZERO,
        },
        Duration::from_secs(2),
    );

    for _ in 0..20 {
        match h
            .orchestrator
            .create_or_update(password_login("casuser", START_MS), None)
            .await
        {
            Ok(root) => assert!(root.id().as_str().starts_with("TGT-")),
            Err(OrchestratorError::TicketCreation {
                source: TicketError::StorageUnavailable(_),
                ..
            }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(cache.injected_failures() > 0);
}

#[tokio::test]
async fn test_corrupt_root_record_replaced() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();

    let key = format!("e2e:ticket:{}", root.id());
    assert!(cache.overwrite_raw(&key, b"not a ticket".to_vec()));

    let renewed = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), Some(root.id().as_str()))
        .await
        .unwrap();
    assert_ne!(renewed.id(), root.id());
    assert!(!cache.physically_contains(&key));
    assert!(h.registry.get_root(renewed.id()).await.is_ok());
}

#[tokio::test]
async fn test_grant_with_unreachable_cache() {
    let (h, cache) = distributed(OrchestratorSettings::default());
    let root = h
        .orchestrator
        .create_or_update(password_login("casuser", START_MS), None)
        .await
        .unwrap();
    cache.set_reachable(false);

    assert!(matches!(
        h.orchestrator.grant_derived_ticket(root.id(), SERVICE, None).await,
        Err(TicketError::StorageUnavailable(_))
    ));
    assert!(matches!(
        h.orchestrator.destroy_session(root.id()).await,
        Err(TicketError::StorageUnavailable(_))
    ));

    cache.set_reachable(true);
    assert_eq!(h.registry.get_root(root.id()).await.unwrap().descendants().len(), 0);
}
