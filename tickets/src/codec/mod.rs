//! Ticket serialization codec.
//!
//! Converts tickets (including their concrete expiration policy variant) to
//! and from the bytes stored in external backends.
//!
//! # Format
//!
//! ```text
//! +--------+---------------------------+-----------+
//! | format | protobuf record (varlen)  | crc32 LE  |
//! | 1 byte |                           | 4 bytes   |
//! +--------+---------------------------+-----------+
//! ```
//!
//! The checksum covers everything before it. The protobuf record is
//! [`records::TicketRecord`]; the policy variant is a `oneof` with explicit
//! tags, so any reader recognizes the variant without reflection.
//!
//! # Invariants
//!
//! - `decode(encode(t)) == t` for every ticket, apart from the registry
//!   `version`, which is storage metadata and not part of the payload.
//! - Unknown format bytes, unknown kinds, unknown policy variants and
//!   checksum mismatches are reported as errors, never guessed around.

pub mod records;

use std::collections::BTreeMap;

use prost::Message;
use prost_types::Timestamp;

use crate::error::TicketError;
use crate::expiration::ExpirationPolicy;
use crate::ticket::{Descendant, DerivedTicket, RootSessionTicket, Ticket, TicketState};
use crate::types::{Attributes, Authentication, Principal, TicketId, TicketKind};

use records::{
    AttributeValues, AuthenticationRecord, DescendantRecord, HardTimeoutRecord,
    MultiUseOrTimeoutRecord, NeverExpiresRecord, PolicyRecord, RecordKind, ThrottledRecord,
    TicketRecord, TimeoutRecord, policy_record,
};

/// Current envelope format.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the format byte.
const FORMAT_SIZE: usize = 1;

/// Size of the trailing CRC32 checksum.
const CHECKSUM_SIZE: usize = 4;

/// Errors that can occur while decoding a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The record is too short to contain an envelope.
    Truncated(usize),
    /// The format byte is not supported by this reader.
    UnsupportedFormat(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The protobuf payload could not be decoded.
    Protobuf(String),
    /// The record kind is unknown.
    UnknownKind(i32),
    /// The expiration policy variant is missing or unknown.
    UnknownPolicyVariant,
    /// The stored policy parameters are invalid.
    InvalidPolicy(String),
    /// A required field is missing.
    MissingField(&'static str),
    /// A timestamp is out of range.
    InvalidTimestamp(&'static str),
    /// The id prefix does not match the record kind.
    KindMismatch(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "record truncated ({len} bytes)"),
            Self::UnsupportedFormat(format) => {
                write!(f, "unsupported record format: 0x{format:02x}")
            }
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "record checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::Protobuf(e) => write!(f, "protobuf decode error: {e}"),
            Self::UnknownKind(kind) => write!(f, "unknown ticket kind: {kind}"),
            Self::UnknownPolicyVariant => write!(f, "unknown expiration policy variant"),
            Self::InvalidPolicy(e) => write!(f, "invalid expiration policy: {e}"),
            Self::MissingField(field) => write!(f, "missing field: {field}"),
            Self::InvalidTimestamp(field) => write!(f, "invalid timestamp in field: {field}"),
            Self::KindMismatch(id) => write!(f, "ticket id {id} does not match record kind"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<prost::DecodeError> for CodecError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Protobuf(e.to_string())
    }
}

impl From<CodecError> for TicketError {
    fn from(e: CodecError) -> Self {
        Self::Deserialization(e.to_string())
    }
}

/// Wrap a payload in the checksummed envelope.
pub(crate) fn seal(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FORMAT_SIZE + payload.len() + CHECKSUM_SIZE);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(payload);
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes
}

/// Verify the envelope and return the payload.
pub(crate) fn open(bytes: &[u8]) -> Result<&[u8], CodecError> {
    if bytes.len() < FORMAT_SIZE + CHECKSUM_SIZE {
        return Err(CodecError::Truncated(bytes.len()));
    }
    let body_len = bytes.len() - CHECKSUM_SIZE;
    let stored_checksum = u32::from_le_bytes([
        bytes[body_len],
        bytes[body_len + 1],
        bytes[body_len + 2],
        bytes[body_len + 3],
    ]);
    let computed_checksum = crc32fast::hash(&bytes[..body_len]);
    if stored_checksum != computed_checksum {
        return Err(CodecError::ChecksumMismatch {
            expected: stored_checksum,
            actual: computed_checksum,
        });
    }
    if bytes[0] != FORMAT_VERSION {
        return Err(CodecError::UnsupportedFormat(bytes[0]));
    }
    Ok(&bytes[FORMAT_SIZE..body_len])
}

/// Serialize a ticket for storage.
#[must_use]
pub fn encode_ticket(ticket: &Ticket) -> Vec<u8> {
    seal(&ticket_to_record(ticket).encode_to_vec())
}

/// Deserialize a stored ticket.
///
/// The returned ticket has version zero; the registry sets it from the
/// backend's metadata.
pub fn decode_ticket(bytes: &[u8]) -> Result<Ticket, CodecError> {
    let record = TicketRecord::decode(open(bytes)?)?;
    record_to_ticket(record)
}

/// Serialize an expiration policy on its own.
#[must_use]
pub fn encode_policy(policy: &ExpirationPolicy) -> Vec<u8> {
    seal(&policy_to_record(policy).encode_to_vec())
}

/// Deserialize an expiration policy on its own.
pub fn decode_policy(bytes: &[u8]) -> Result<ExpirationPolicy, CodecError> {
    let record = PolicyRecord::decode(open(bytes)?)?;
    record_to_policy(record)
}

pub(crate) fn to_timestamp(ms: u64) -> Timestamp {
    Timestamp {
        seconds: i64::try_from(ms / 1000).unwrap_or(i64::MAX),
        nanos: i32::try_from((ms % 1000) * 1_000_000).unwrap_or(0),
    }
}

pub(crate) fn from_timestamp(
    timestamp: Option<&Timestamp>,
    field: &'static str,
) -> Result<u64, CodecError> {
    let timestamp = timestamp.ok_or(CodecError::MissingField(field))?;
    let seconds = u64::try_from(timestamp.seconds).map_err(|_| CodecError::InvalidTimestamp(field))?;
    let nanos = u64::try_from(timestamp.nanos).map_err(|_| CodecError::InvalidTimestamp(field))?;
    seconds
        .checked_mul(1000)
        .and_then(|ms| ms.checked_add(nanos / 1_000_000))
        .ok_or(CodecError::InvalidTimestamp(field))
}

fn policy_to_record(policy: &ExpirationPolicy) -> PolicyRecord {
    let variant = match *policy {
        ExpirationPolicy::NeverExpires => policy_record::Variant::NeverExpires(NeverExpiresRecord {}),
        ExpirationPolicy::Timeout {
            time_to_kill_ms,
            max_time_to_live_ms,
        } => policy_record::Variant::Timeout(TimeoutRecord {
            time_to_kill_ms,
            max_time_to_live_ms,
        }),
        ExpirationPolicy::MultiUseOrTimeout {
            max_uses,
            time_to_kill_ms,
        } => policy_record::Variant::MultiUseOrTimeout(MultiUseOrTimeoutRecord {
            max_uses,
            time_to_kill_ms,
        }),
        ExpirationPolicy::HardTimeout { time_to_kill_ms } => {
            policy_record::Variant::HardTimeout(HardTimeoutRecord { time_to_kill_ms })
        }
        ExpirationPolicy::Throttled {
            time_to_kill_ms,
            time_in_between_uses_ms,
        } => policy_record::Variant::Throttled(ThrottledRecord {
            time_to_kill_ms,
            time_in_between_uses_ms,
        }),
    };
    PolicyRecord {
        variant: Some(variant),
    }
}

fn record_to_policy(record: PolicyRecord) -> Result<ExpirationPolicy, CodecError> {
    let policy = match record.variant.ok_or(CodecError::UnknownPolicyVariant)? {
        policy_record::Variant::NeverExpires(_) => ExpirationPolicy::NeverExpires,
        policy_record::Variant::Timeout(r) => ExpirationPolicy::Timeout {
            time_to_kill_ms: r.time_to_kill_ms,
            max_time_to_live_ms: r.max_time_to_live_ms,
        },
        policy_record::Variant::MultiUseOrTimeout(r) => ExpirationPolicy::MultiUseOrTimeout {
            max_uses: r.max_uses,
            time_to_kill_ms: r.time_to_kill_ms,
        },
        policy_record::Variant::HardTimeout(r) => ExpirationPolicy::HardTimeout {
            time_to_kill_ms: r.time_to_kill_ms,
        },
        policy_record::Variant::Throttled(r) => ExpirationPolicy::Throttled {
            time_to_kill_ms: r.time_to_kill_ms,
            time_in_between_uses_ms: r.time_in_between_uses_ms,
        },
    };
    policy
        .validate()
        .map_err(|e| CodecError::InvalidPolicy(e.to_string()))?;
    Ok(policy)
}

fn attributes_to_record(attributes: &Attributes) -> BTreeMap<String, AttributeValues> {
    attributes
        .iter()
        .map(|(name, values)| {
            (
                name.clone(),
                AttributeValues {
                    values: values.clone(),
                },
            )
        })
        .collect()
}

fn record_to_attributes(record: BTreeMap<String, AttributeValues>) -> Attributes {
    record
        .into_iter()
        .map(|(name, values)| (name, values.values))
        .collect()
}

fn authentication_to_record(authentication: &Authentication) -> AuthenticationRecord {
    AuthenticationRecord {
        principal_id: authentication.principal.id.clone(),
        principal_attributes: attributes_to_record(&authentication.principal.attributes),
        attributes: attributes_to_record(&authentication.attributes),
        successful_handlers: authentication.successful_handlers.iter().cloned().collect(),
        authenticated_at: Some(to_timestamp(authentication.authenticated_at_ms)),
    }
}

fn record_to_authentication(record: AuthenticationRecord) -> Result<Authentication, CodecError> {
    let authenticated_at_ms =
        from_timestamp(record.authenticated_at.as_ref(), "authentication.authenticated_at")?;
    Ok(Authentication {
        principal: Principal {
            id: record.principal_id,
            attributes: record_to_attributes(record.principal_attributes),
        },
        attributes: record_to_attributes(record.attributes),
        successful_handlers: record.successful_handlers.into_iter().collect(),
        authenticated_at_ms,
    })
}

fn ticket_to_record(ticket: &Ticket) -> TicketRecord {
    let state = ticket.state();
    let mut record = TicketRecord {
        kind: 0,
        id: state.id().as_str().to_string(),
        created_at: Some(to_timestamp(state.created_at_ms())),
        last_used_at: Some(to_timestamp(state.last_used_ms())),
        previous_last_used_at: Some(to_timestamp(state.previous_last_used_ms())),
        use_count: state.use_count(),
        expiration_policy: Some(policy_to_record(state.expiration_policy())),
        ..TicketRecord::default()
    };
    match ticket {
        Ticket::Root(root) => {
            record.set_kind(RecordKind::Root);
            record.authentication = Some(authentication_to_record(root.authentication()));
            record.descendants = root
                .descendants()
                .iter()
                .map(|descendant| DescendantRecord {
                    id: descendant.id.as_str().to_string(),
                    service: descendant.service.clone(),
                    tracking_key: descendant.tracking_key.clone(),
                })
                .collect();
        }
        Ticket::Derived(derived) => {
            record.set_kind(RecordKind::Derived);
            record.parent_id = derived.parent_id().as_str().to_string();
            record.service = derived.service().to_string();
        }
    }
    record
}

fn record_to_ticket(record: TicketRecord) -> Result<Ticket, CodecError> {
    let kind = RecordKind::try_from(record.kind).map_err(|_| CodecError::UnknownKind(record.kind))?;
    let policy = record_to_policy(
        record
            .expiration_policy
            .ok_or(CodecError::MissingField("expiration_policy"))?,
    )?;
    let id = TicketId::new(record.id);
    let state = TicketState::restore(
        id.clone(),
        from_timestamp(record.created_at.as_ref(), "created_at")?,
        from_timestamp(record.last_used_at.as_ref(), "last_used_at")?,
        from_timestamp(record.previous_last_used_at.as_ref(), "previous_last_used_at")?,
        record.use_count,
        policy,
    );

    match kind {
        RecordKind::Root => {
            if id.kind() != Some(TicketKind::Root) {
                return Err(CodecError::KindMismatch(id.to_string()));
            }
            let authentication = record_to_authentication(
                record
                    .authentication
                    .ok_or(CodecError::MissingField("authentication"))?,
            )?;
            let descendants = record
                .descendants
                .into_iter()
                .map(|d| Descendant {
                    id: TicketId::new(d.id),
                    service: d.service,
                    tracking_key: d.tracking_key,
                })
                .collect();
            Ok(Ticket::Root(RootSessionTicket::restore(
                state,
                authentication,
                descendants,
            )))
        }
        RecordKind::Derived => {
            if id.kind() != Some(TicketKind::Derived) {
                return Err(CodecError::KindMismatch(id.to_string()));
            }
            if record.parent_id.is_empty() {
                return Err(CodecError::MissingField("parent_id"));
            }
            Ok(Ticket::Derived(DerivedTicket::restore(
                state,
                TicketId::new(record.parent_id),
                record.service,
            )))
        }
        RecordKind::Unspecified => Err(CodecError::UnknownKind(record.kind)),
    }
}
