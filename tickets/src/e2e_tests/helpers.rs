//! Common helpers for end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{FaultConfig, InMemoryCache};
use crate::orchestrator::{OrchestratorSettings, TicketOrchestrator};
use crate::registry::{
    DistributedRegistrySettings, DistributedTicketRegistry, InMemoryTicketRegistry, TicketRegistry,
};
use crate::testing::init_tracing;
use crate::time::ManualClock;

pub use crate::testing::password_login;

/// Start of every test clock: 2023-11-14T22:13:20Z.
pub const START_MS: u64 = 1_700_000_000_000;

/// Service used by most scenarios.
pub const SERVICE: &str = "https://app.example.org";

/// An orchestrator wired to a registry and a manual clock.
pub struct Harness<R: TicketRegistry> {
    pub clock: Arc<ManualClock>,
    pub registry: Arc<R>,
    pub orchestrator: Arc<TicketOrchestrator<R>>,
}

impl<R: TicketRegistry> Harness<R> {
    fn assemble(clock: Arc<ManualClock>, registry: Arc<R>, settings: OrchestratorSettings) -> Self {
        init_tracing();
        #[allow(clippy::expect_used)]
        let orchestrator = TicketOrchestrator::new(Arc::clone(&registry), clock.clone(), settings)
            .expect("valid orchestrator settings");
        Self {
            clock,
            registry,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Harness over the in-process registry.
#[must_use]
pub fn in_memory(settings: OrchestratorSettings) -> Harness<InMemoryTicketRegistry> {
    let clock = Arc::new(ManualClock::new(START_MS));
    let registry = Arc::new(InMemoryTicketRegistry::new(clock.clone()));
    Harness::assemble(clock, registry, settings)
}

/// Harness over the distributed registry, plus the simulated cache behind it.
#[must_use]
pub fn distributed(
    settings: OrchestratorSettings,
) -> (Harness<DistributedTicketRegistry<InMemoryCache>>, Arc<InMemoryCache>) {
    distributed_with_faults(settings, FaultConfig::no_faults(), Duration::from_secs(2))
}

/// Harness over the distributed registry with fault injection.
#[must_use]
pub fn distributed_with_faults(
    settings: OrchestratorSettings,
    faults: FaultConfig,
    op_timeout: Duration,
) -> (Harness<DistributedTicketRegistry<InMemoryCache>>, Arc<InMemoryCache>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = Arc::new(InMemoryCache::with_faults(clock.clone(), 42, faults));
    let registry = Arc::new(DistributedTicketRegistry::new(
        Arc::clone(&cache),
        clock.clone(),
        DistributedRegistrySettings {
            namespace: "e2e".to_string(),
            op_timeout,
        },
    ));
    (Harness::assemble(clock, registry, settings), cache)
}

/// A second registry sharing the cache and clock of `harness`, as another
/// process would.
#[must_use]
pub fn peer_registry(
    harness: &Harness<DistributedTicketRegistry<InMemoryCache>>,
    cache: &Arc<InMemoryCache>,
) -> DistributedTicketRegistry<InMemoryCache> {
    DistributedTicketRegistry::new(
        Arc::clone(cache),
        harness.clock.clone(),
        harness.registry.settings().clone(),
    )
}
