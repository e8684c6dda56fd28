//! Background removal of expired tickets for the in-process registry.
//!
//! # Design
//!
//! The sweeper task holds a `Weak<InMemoryTicketRegistry>`:
//! - The owner keeps the registry alive through its `Arc`
//! - Each tick upgrades the weak reference and sweeps
//! - When the registry is dropped, `Weak::upgrade()` returns `None` and the task exits
//!
//! Reads never depend on the sweeper: `get` checks expiration itself. The
//! sweeper only bounds memory held by tickets nobody asks for again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::registry::InMemoryTicketRegistry;

/// Configuration for the sweeper.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Delay between two sweeps.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Spawn a background sweeper for `registry`.
///
/// # Returns
/// A `JoinHandle` that can be used to await the task or abort it on shutdown.
///
/// # Invariants
/// - Uses a `Weak` reference, so the task never keeps the registry alive
/// - Exits cleanly when the registry is dropped or its lock is poisoned
pub fn spawn_sweeper(registry: Weak<InMemoryTicketRegistry>, config: SweepConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        sweep_loop(registry, config).await;
    })
}

impl InMemoryTicketRegistry {
    /// Spawn a sweeper for this registry if a tokio runtime is running.
    ///
    /// Returns `None` outside a runtime, so synchronous callers can still
    /// construct registries and rely on read-time expiry.
    #[must_use]
    pub fn start_sweeper(self: &Arc<Self>, config: SweepConfig) -> Option<JoinHandle<()>> {
        if Handle::try_current().is_err() {
            debug!("no tokio runtime, ticket sweeper not started");
            return None;
        }
        Some(spawn_sweeper(Arc::downgrade(self), config))
    }
}

async fn sweep_loop(registry: Weak<InMemoryTicketRegistry>, config: SweepConfig) {
    let mut ticker = tokio::time::interval(config.interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            info!("ticket registry dropped, sweeper exiting");
            break;
        };

        match registry.sweep_expired() {
            Ok(removed) => debug!(removed, "sweep complete"),
            Err(e) => {
                error!(error = %e, "sweeper stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ExpirationPolicy;
    use crate::registry::TicketRegistry;
    use crate::ticket::RootSessionTicket;
    use crate::time::ManualClock;
    use crate::types::{Authentication, Principal, TicketId};

    fn fast() -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(InMemoryTicketRegistry::new(clock.clone()));
        let ticket = RootSessionTicket::new(
            TicketId::new("TGT-1-a"),
            Authentication::new(Principal::new("casuser"), 1_000),
            ExpirationPolicy::HardTimeout {
                time_to_kill_ms: 100,
            },
            1_000,
        );
        registry.add(ticket.into()).await.unwrap();
        let handle = registry.start_sweeper(fast()).unwrap();

        clock.advance_ms(101);
        let mut emptied = false;
        for _ in 0..100 {
            if registry.is_empty().unwrap() {
                emptied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(emptied, "sweeper should remove the expired ticket");
        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_registry_dropped() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(InMemoryTicketRegistry::new(clock));
        let handle = spawn_sweeper(Arc::downgrade(&registry), fast());

        drop(registry);

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "sweeper should exit when registry is dropped");
    }

    #[test]
    fn test_start_sweeper_outside_runtime() {
        let registry = Arc::new(InMemoryTicketRegistry::new(Arc::new(ManualClock::new(0))));
        assert!(registry.start_sweeper(SweepConfig::default()).is_none());
    }

    #[test]
    fn test_sweep_config_default() {
        assert_eq!(SweepConfig::default().interval, Duration::from_secs(60));
    }
}
