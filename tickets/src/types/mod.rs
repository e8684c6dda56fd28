pub mod authentication;
pub mod ids;

pub use authentication::{Attributes, Authentication, Principal};
pub use ids::{TicketId, TicketIdGenerator, TicketKind};

use sha2::{Digest, Sha256};

/// Hash a principal id into a key segment for external storage.
///
/// # Post-conditions
///
/// - Returns a 64-character lowercase hex string.
/// - The same `principal_id` always produces the same hash.
/// - The raw principal id never appears in storage keys.
#[must_use]
pub fn hash_principal_id(principal_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal_id.as_bytes());
    let result = hasher.finalize();
    result.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_principal_id_produces_64_char_hex() {
        let hash = hash_principal_id("casuser");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_principal_id_known_value() {
        assert_eq!(
            hash_principal_id("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_hash_principal_id_distinguishes_principals() {
        assert_ne!(hash_principal_id("alice"), hash_principal_id("bob"));
    }
}
