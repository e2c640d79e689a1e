// Key Store: current symmetric key material per peer
//
// One entry per peer id (the local session id holds our own outbound key).
// Entries are replaced wholesale, never merged and never removed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES key and IV, both base64 encoded
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub key: String,
    pub iv: String,
}

impl KeyMaterial {
    pub fn new(key: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: iv.into(),
        }
    }

    /// Parse the `"key:iv"` form used by every key endpoint
    pub fn parse_pair(pair: &str) -> Option<Self> {
        let (key, iv) = pair.trim().split_once(':')?;
        if key.is_empty() || iv.is_empty() {
            return None;
        }
        Some(Self::new(key, iv))
    }

    pub fn to_pair(&self) -> String {
        format!("{}:{}", self.key, self.iv)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Outcome of replacing a peer's entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComparison {
    /// No entry existed before
    Missing,
    /// The new material equals the old one
    Identical,
    /// The new material differs from the old one
    Changed,
}

/// In-memory peer → key map
#[derive(Default)]
pub struct KeyStore {
    entries: RwLock<HashMap<String, KeyMaterial>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<KeyMaterial> {
        self.entries.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.read().contains_key(peer_id)
    }

    pub fn insert(&self, peer_id: &str, material: KeyMaterial) {
        self.entries.write().insert(peer_id.to_string(), material);
    }

    /// Store `material` for `peer_id` and report how it compares to the
    /// previous entry. The read, compare and write happen under one lock so
    /// concurrent refreshes for the same peer cannot interleave.
    pub fn replace(&self, peer_id: &str, material: KeyMaterial) -> KeyComparison {
        let mut entries = self.entries.write();
        let comparison = match entries.get(peer_id) {
            None => KeyComparison::Missing,
            Some(existing) if *existing == material => KeyComparison::Identical,
            Some(_) => KeyComparison::Changed,
        };
        entries.insert(peer_id.to_string(), material);
        comparison
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let material = KeyMaterial::parse_pair("a2V5:aXY=").unwrap();
        assert_eq!(material.key, "a2V5");
        assert_eq!(material.iv, "aXY=");
        assert_eq!(material.to_pair(), "a2V5:aXY=");
    }

    #[test]
    fn test_parse_pair_rejects_garbage() {
        assert!(KeyMaterial::parse_pair("no-separator").is_none());
        assert!(KeyMaterial::parse_pair(":iv").is_none());
        assert!(KeyMaterial::parse_pair("key:").is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let material = KeyMaterial::new("secret-key", "secret-iv");
        let rendered = format!("{:?}", material);
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_replace_reports_comparison() {
        let store = KeyStore::new();
        let k1 = KeyMaterial::new("k1", "v1");
        let k2 = KeyMaterial::new("k2", "v2");

        assert_eq!(store.replace("peer", k1.clone()), KeyComparison::Missing);
        assert_eq!(store.replace("peer", k1.clone()), KeyComparison::Identical);
        assert_eq!(store.replace("peer", k2.clone()), KeyComparison::Changed);
        assert_eq!(store.get("peer"), Some(k2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_overwrites_wholesale() {
        let store = KeyStore::new();
        store.insert("peer", KeyMaterial::new("k1", "v1"));
        store.insert("peer", KeyMaterial::new("k2", "v1"));

        assert_eq!(store.get("peer").unwrap().key, "k2");
        assert!(store.contains("peer"));
        assert!(!store.contains("other"));
        assert!(!store.is_empty());
    }
}
