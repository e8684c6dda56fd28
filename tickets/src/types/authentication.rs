//! Authentication outcomes bound to root session tickets.
//!
//! The engine treats an [`Authentication`] as opaque except for two
//! operations: identity comparison (to decide whether a re-authentication
//! renews the existing session) and attribute merge.

use std::collections::{BTreeMap, BTreeSet};

/// Multi-valued string attributes.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// The authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Principal {
    /// Principal identifier (e.g. the username).
    pub id: String,
    /// Attributes released for the principal.
    pub attributes: Attributes,
}

impl Principal {
    /// Create a principal with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }
}

/// The outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Authentication {
    /// The authenticated principal.
    pub principal: Principal,
    /// Attributes describing the authentication event itself.
    pub attributes: Attributes,
    /// Names of the authentication handlers that succeeded.
    pub successful_handlers: BTreeSet<String>,
    /// When the authentication happened, in milliseconds since Unix epoch.
    pub authenticated_at_ms: u64,
}

impl Authentication {
    /// Create an authentication for `principal` at the given instant.
    #[must_use]
    pub fn new(principal: Principal, authenticated_at_ms: u64) -> Self {
        Self {
            principal,
            attributes: Attributes::new(),
            successful_handlers: BTreeSet::new(),
            authenticated_at_ms,
        }
    }

    /// Builder-style helper to record a successful handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.successful_handlers.insert(handler.into());
        self
    }

    /// Builder-style helper to set an authentication attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.attributes.insert(name.into(), values);
        self
    }

    /// Whether `other` identifies the same subject.
    ///
    /// Compares the principal id and the set of successful handlers only;
    /// attributes may differ between logins of the same subject.
    #[must_use]
    pub fn is_identity_equal(&self, other: &Self) -> bool {
        self.principal.id == other.principal.id
            && self.successful_handlers == other.successful_handlers
    }

    /// Merge a newer authentication of the same subject into this one.
    ///
    /// Attributes from `newer` overwrite same-named attributes here; attributes
    /// only present here are kept. The authentication instant moves forward
    /// and never backwards.
    pub fn merge_from(&mut self, newer: &Self) {
        for (name, values) in &newer.attributes {
            self.attributes.insert(name.clone(), values.clone());
        }
        for (name, values) in &newer.principal.attributes {
            self.principal.attributes.insert(name.clone(), values.clone());
        }
        self.authenticated_at_ms = self.authenticated_at_ms.max(newer.authenticated_at_ms);
    }
}
