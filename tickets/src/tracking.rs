//! Session tracking policies.
//!
//! Decide which descendant ids a root session ticket keeps when a new
//! derived ticket is granted.
//!
//! - [`SessionTrackingPolicy::TrackAll`] appends every descendant.
//! - [`SessionTrackingPolicy::MostRecentPerKey`] keeps one descendant per
//!   tracking key. A new grant with a key already present replaces the old
//!   entry, and the superseded ticket is logically invalid from then on
//!   (registries treat a derived ticket its parent no longer lists as expired).
//!
//! The tracking key is an opaque caller-supplied string (device fingerprint,
//! client id, ...). Descendants granted without a key are always appended.

use crate::ticket::Descendant;
use crate::types::TicketId;

/// Rule governing which derived tickets a root ticket retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionTrackingPolicy {
    /// Keep every descendant.
    #[default]
    TrackAll,
    /// Keep only the most recent descendant for each tracking key.
    MostRecentPerKey,
}

impl SessionTrackingPolicy {
    /// Select the policy from the "only track most recent session" switch.
    #[must_use]
    pub const fn from_only_track_most_recent(only_most_recent: bool) -> Self {
        if only_most_recent {
            Self::MostRecentPerKey
        } else {
            Self::TrackAll
        }
    }

    /// Add `descendant` to `descendants`, returning the ids evicted.
    pub fn track(self, descendants: &mut Vec<Descendant>, descendant: Descendant) -> Vec<TicketId> {
        let mut evicted = Vec::new();
        if let (Self::MostRecentPerKey, Some(key)) = (self, descendant.tracking_key.as_deref()) {
            descendants.retain(|existing| {
                if existing.tracking_key.as_deref() == Some(key) {
                    evicted.push(existing.id.clone());
                    false
                } else {
                    true
                }
            });
        }
        descendants.push(descendant);
        evicted
    }
}
