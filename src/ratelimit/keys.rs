//! Store key derivation for a client key.

use std::fmt;

/// The set of store keys holding one client's limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpace {
    /// The client key these store keys were derived from
    pub client: String,
    /// Ordered set of admitted request timestamps
    pub log: String,
    /// Remaining tokens in the bucket
    pub tokens: String,
    /// Timestamp of the last refill event
    pub last_refill: String,
    /// Revision counter guarding optimistic commits
    pub revision: String,
}

impl KeySpace {
    /// Derive the store keys for `client`, namespaced under `prefix`.
    pub fn new(prefix: &str, client: &str) -> Self {
        Self {
            client: client.to_string(),
            log: format!("{}log:{}", prefix, client),
            tokens: format!("{}tokens:{}", prefix, client),
            last_refill: format!("{}lastRefill:{}", prefix, client),
            revision: format!("{}rev:{}", prefix, client),
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client)
    }
}
