//! Shared test utilities.

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::types::{Authentication, Principal};

static TRACING: Once = Once::new();

/// Install a `fmt` subscriber once per test binary.
///
/// Filtered by `RUST_LOG`, defaulting to `tickets=debug`. Output goes through
/// the test writer so it is only shown for failing tests.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tickets=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A password authentication of `principal` at `at_ms`.
#[must_use]
pub fn password_login(principal: &str, at_ms: u64) -> Authentication {
    Authentication::new(Principal::new(principal), at_ms).with_handler("password")
}
