//! Multifactor trusted-device records.
//!
//! After a successful second-factor challenge, a user can mark the device as
//! trusted so later logins from it skip the challenge until the record
//! expires. Records live in the same network cache as distributed tickets:
//!
//! ```text
//! {namespace}:trust:{sha256(principal)}:{record_key} -> sealed TrustRecord
//! ```
//!
//! Each record carries a physical TTL matching its expiration, and readers
//! also check the expiration, so an expired record is never returned.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use rand::distr::{Alphanumeric, SampleString};
use tracing::{debug, warn};

use crate::cache::{CacheClient, bounded};
use crate::codec::records::TrustRecord;
use crate::codec::{CodecError, from_timestamp, open, seal, to_timestamp};
use crate::error::TicketError;
use crate::time::Clock;
use crate::types::hash_principal_id;

/// Length of generated record keys.
const RECORD_KEY_LENGTH: usize = 24;

/// A device a principal chose to trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedDevice {
    /// Unique key of this record.
    pub record_key: String,
    /// The principal who trusted the device.
    pub principal: String,
    /// Fingerprint identifying the device.
    pub device_fingerprint: String,
    /// Human-readable device name.
    pub name: String,
    /// When the device was trusted, in milliseconds since Unix epoch.
    pub record_date_ms: u64,
    /// When the trust lapses, in milliseconds since Unix epoch.
    pub expires_at_ms: u64,
}

impl TrustedDevice {
    /// Create a record with a freshly generated key.
    #[must_use]
    pub fn new(
        principal: impl Into<String>,
        device_fingerprint: impl Into<String>,
        name: impl Into<String>,
        record_date_ms: u64,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            record_key: Alphanumeric.sample_string(&mut rand::rng(), RECORD_KEY_LENGTH),
            principal: principal.into(),
            device_fingerprint: device_fingerprint.into(),
            name: name.into(),
            record_date_ms,
            expires_at_ms,
        }
    }

    /// Whether the trust has lapsed at `now_ms`.
    #[must_use]
    pub const fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    fn to_record(&self) -> TrustRecord {
        TrustRecord {
            record_key: self.record_key.clone(),
            principal: self.principal.clone(),
            device_fingerprint: self.device_fingerprint.clone(),
            name: self.name.clone(),
            record_date: Some(to_timestamp(self.record_date_ms)),
            expires_at: Some(to_timestamp(self.expires_at_ms)),
        }
    }

    fn from_record(record: TrustRecord) -> Result<Self, CodecError> {
        Ok(Self {
            record_date_ms: from_timestamp(record.record_date.as_ref(), "record_date")?,
            expires_at_ms: from_timestamp(record.expires_at.as_ref(), "expires_at")?,
            record_key: record.record_key,
            principal: record.principal,
            device_fingerprint: record.device_fingerprint,
            name: record.name,
        })
    }
}

/// Storage for trusted-device records in a network cache.
#[derive(Debug)]
pub struct TrustStorage<C: CacheClient> {
    cache: Arc<C>,
    clock: Arc<dyn Clock>,
    namespace: String,
    op_timeout: Duration,
}

impl<C: CacheClient> TrustStorage<C> {
    #[must_use]
    pub fn new(
        cache: Arc<C>,
        clock: Arc<dyn Clock>,
        namespace: impl Into<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            clock,
            namespace: namespace.into(),
            op_timeout,
        }
    }

    fn prefix(&self) -> String {
        format!("{}:trust:", self.namespace)
    }

    fn principal_prefix(&self, principal: &str) -> String {
        format!("{}{}:", self.prefix(), hash_principal_id(principal))
    }

    /// Store a record.
    ///
    /// # Errors
    ///
    /// - `InvalidTicketState` if the record is already expired
    /// - `StorageUnavailable` if the cache cannot be reached
    pub async fn save(&self, device: TrustedDevice) -> Result<TrustedDevice, TicketError> {
        let now = self.clock.now_ms();
        if device.is_expired_at(now) {
            return Err(TicketError::InvalidTicketState(format!(
                "trust record {} is already expired",
                device.record_key
            )));
        }
        let key = format!("{}{}", self.principal_prefix(&device.principal), device.record_key);
        let ttl = Duration::from_millis(device.expires_at_ms.saturating_sub(now));
        let bytes = seal(&device.to_record().encode_to_vec());

        bounded("put", self.op_timeout, self.cache.put(&key, bytes, Some(ttl))).await?;
        debug!(record_key = %device.record_key, "saved trusted device");
        Ok(device)
    }

    /// Fetch a record by key.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the cache cannot be reached.
    pub async fn get(&self, record_key: &str) -> Result<Option<TrustedDevice>, TicketError> {
        let suffix = format!(":{record_key}");
        for key in self.keys(&self.prefix()).await? {
            if key.ends_with(&suffix) {
                return self.load(&key).await;
            }
        }
        Ok(None)
    }

    /// Every live record of `principal`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the cache cannot be reached.
    pub async fn get_for_principal(&self, principal: &str) -> Result<Vec<TrustedDevice>, TicketError> {
        let keys = self.keys(&self.principal_prefix(principal)).await?;
        self.load_all(&keys, |_| true).await
    }

    /// Every live record, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the cache cannot be reached.
    pub async fn get_all(&self) -> Result<Vec<TrustedDevice>, TicketError> {
        self.get_since(0).await
    }

    /// Every live record trusted at or after `since_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the cache cannot be reached.
    pub async fn get_since(&self, since_ms: u64) -> Result<Vec<TrustedDevice>, TicketError> {
        let keys = self.keys(&self.prefix()).await?;
        self.load_all(&keys, |device| device.record_date_ms >= since_ms).await
    }

    /// Delete a record by key, returning whether one was removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the cache cannot be reached.
    pub async fn remove(&self, record_key: &str) -> Result<bool, TicketError> {
        let suffix = format!(":{record_key}");
        let mut removed = false;
        for key in self.keys(&self.prefix()).await? {
            if key.ends_with(&suffix) {
                removed |= bounded("delete", self.op_timeout, self.cache.delete(&key)).await?;
            }
        }
        Ok(removed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TicketError> {
        bounded("scan_prefix", self.op_timeout, self.cache.scan_prefix(prefix)).await
    }

    async fn load_all(
        &self,
        keys: &[String],
        keep: impl Fn(&TrustedDevice) -> bool,
    ) -> Result<Vec<TrustedDevice>, TicketError> {
        let mut devices = Vec::new();
        for key in keys {
            if let Some(device) = self.load(key).await? {
                if keep(&device) {
                    devices.push(device);
                }
            }
        }
        devices.sort_by_key(|device| device.record_date_ms);
        Ok(devices)
    }

    /// Read one record; unreadable or expired records read as absent.
    async fn load(&self, key: &str) -> Result<Option<TrustedDevice>, TicketError> {
        let Some(entry) = bounded("get", self.op_timeout, self.cache.get(key)).await? else {
            return Ok(None);
        };
        let decoded = open(&entry.value)
            .and_then(|payload| TrustRecord::decode(payload).map_err(CodecError::from))
            .and_then(TrustedDevice::from_record);
        match decoded {
            Ok(device) if device.is_expired_at(self.clock.now_ms()) => Ok(None),
            Ok(device) => Ok(Some(device)),
            Err(e) => {
                warn!(key, error = %e, "undecodable trust record");
                Ok(None)
            }
        }
    }
}
