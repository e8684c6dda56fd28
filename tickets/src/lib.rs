// Life of a login:
// 1. An authentication outcome arrives, possibly with an existing root ticket id
// 2. The orchestrator looks the root ticket up in the registry
//     - Missing or expired: issue a new root ticket
//     - Same identity: merge attributes, keep the id
//     - Different identity: delete the old one, issue a new one
// 3. Services ask for derived tickets against the root ticket
//     - Root use count / last-used / descendants updated under CAS
//     - Tracking policy evicts superseded descendants
//
// System components:
//  - Expiration policies (pure, clock-injected)
//  - Codec (checksummed protobuf records)
//  - Registries (in-process map, distributed network cache)
//  - Orchestrator

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod expiration;
pub mod orchestrator;
pub mod registry;
pub mod ticket;
pub mod time;
pub mod tracking;
pub mod trust;
pub mod types;

mod e2e_tests;
#[cfg(test)]
mod testing;

pub use error::{OrchestratorError, TicketError};
pub use expiration::ExpirationPolicy;
pub use orchestrator::{OrchestratorSettings, TicketOrchestrator};
pub use registry::{DistributedTicketRegistry, InMemoryTicketRegistry, TicketRegistry};
pub use ticket::{DerivedTicket, RootSessionTicket, Ticket, TicketState};
pub use time::{Clock, ManualClock, SystemClock};
pub use tracking::SessionTrackingPolicy;
pub use types::{Authentication, Principal, TicketId, TicketKind};
