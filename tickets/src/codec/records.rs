//! Protobuf record definitions for persisted tickets.
//!
//! Tags are part of the storage format and must never be reused or
//! renumbered. New fields and new policy variants get new tags; readers
//! skip fields they do not know.

#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::derive_partial_eq_without_eq)]

use std::collections::BTreeMap;

use prost_types::Timestamp;

/// Kind of a persisted ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Unspecified = 0,
    Root = 1,
    Derived = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TicketRecord {
    #[prost(enumeration = "RecordKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(message, optional, tag = "3")]
    pub created_at: Option<Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub last_used_at: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub previous_last_used_at: Option<Timestamp>,
    #[prost(uint64, tag = "6")]
    pub use_count: u64,
    #[prost(message, optional, tag = "7")]
    pub expiration_policy: Option<PolicyRecord>,
    #[prost(message, optional, tag = "8")]
    pub authentication: Option<AuthenticationRecord>,
    #[prost(message, repeated, tag = "9")]
    pub descendants: Vec<DescendantRecord>,
    #[prost(string, tag = "10")]
    pub parent_id: String,
    #[prost(string, tag = "11")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PolicyRecord {
    #[prost(oneof = "policy_record::Variant", tags = "1, 2, 3, 4, 5")]
    pub variant: Option<policy_record::Variant>,
}

pub mod policy_record {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "1")]
        NeverExpires(super::NeverExpiresRecord),
        #[prost(message, tag = "2")]
        Timeout(super::TimeoutRecord),
        #[prost(message, tag = "3")]
        MultiUseOrTimeout(super::MultiUseOrTimeoutRecord),
        #[prost(message, tag = "4")]
        HardTimeout(super::HardTimeoutRecord),
        #[prost(message, tag = "5")]
        Throttled(super::ThrottledRecord),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NeverExpiresRecord {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeoutRecord {
    #[prost(uint64, tag = "1")]
    pub time_to_kill_ms: u64,
    #[prost(uint64, optional, tag = "2")]
    pub max_time_to_live_ms: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MultiUseOrTimeoutRecord {
    #[prost(uint64, tag = "1")]
    pub max_uses: u64,
    #[prost(uint64, tag = "2")]
    pub time_to_kill_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HardTimeoutRecord {
    #[prost(uint64, tag = "1")]
    pub time_to_kill_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ThrottledRecord {
    #[prost(uint64, tag = "1")]
    pub time_to_kill_ms: u64,
    #[prost(uint64, tag = "2")]
    pub time_in_between_uses_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AttributeValues {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthenticationRecord {
    #[prost(string, tag = "1")]
    pub principal_id: String,
    #[prost(btree_map = "string, message", tag = "2")]
    pub principal_attributes: BTreeMap<String, AttributeValues>,
    #[prost(btree_map = "string, message", tag = "3")]
    pub attributes: BTreeMap<String, AttributeValues>,
    #[prost(string, repeated, tag = "4")]
    pub successful_handlers: Vec<String>,
    #[prost(message, optional, tag = "5")]
    pub authenticated_at: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DescendantRecord {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, optional, tag = "3")]
    pub tracking_key: Option<String>,
}

/// A multifactor trusted-device record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TrustRecord {
    #[prost(string, tag = "1")]
    pub record_key: String,
    #[prost(string, tag = "2")]
    pub principal: String,
    #[prost(string, tag = "3")]
    pub device_fingerprint: String,
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(message, optional, tag = "5")]
    pub record_date: Option<Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub expires_at: Option<Timestamp>,
}
