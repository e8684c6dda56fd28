//! End-to-end tests through the orchestrator.
//!
//! Each test file covers one scenario and runs it against both registry
//! backends, using a manual clock so expiry is deterministic.

#![cfg(test)]

mod helpers;

mod test_concurrent_grants;
mod test_concurrent_sessions;
mod test_derived_lifecycle;
mod test_expiry_across_processes;
mod test_login_lifecycle;
mod test_storage_failures;
