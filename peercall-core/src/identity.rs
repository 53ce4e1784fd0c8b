//! Peer identity abstraction
//!
//! Every per-peer structure in the engine (the call session, adaptive quality
//! state, peer-connection lookup) is keyed by a [`PeerIdentity`]. The engine
//! never interprets the identity beyond equality, hashing and display, so any
//! addressing scheme used by the signaling channel can be plugged in.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Identity of a remote peer as seen by the signaling channel
///
/// Implementations must be cheap to clone and usable as a map key.
pub trait PeerIdentity:
    Clone
    + Debug
    + Display
    + Eq
    + Hash
    + Serialize
    + for<'de> Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// Convert the identity to its wire representation
    fn to_string_repr(&self) -> String;

    /// Parse an identity from its wire representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Stable key for logging and external lookups
    fn unique_id(&self) -> String {
        self.to_string_repr()
    }
}

/// String-backed peer identity
///
/// Used by the in-memory collaborators and the CLI. Applications with their
/// own addressing (user ids, public keys) implement [`PeerIdentity`] directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer identity cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn display_and_repr_match() {
        let id = PeerIdentityString::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.to_string_repr(), "alice");
        assert_eq!(id.unique_id(), "alice");
    }

    #[test]
    fn parse_trims_and_rejects_empty() {
        let id = PeerIdentityString::from_string_repr("  bob ").unwrap();
        assert_eq!(id.as_str(), "bob");
        assert!(PeerIdentityString::from_string_repr("   ").is_err());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = PeerIdentityString::new("carol");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: PeerIdentityString = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(PeerIdentityString::from("dave"), 1);
        assert_eq!(map.get(&PeerIdentityString::new("dave")), Some(&1));
    }
}
