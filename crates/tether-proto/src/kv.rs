//! Canonical key/value section encoding.
//!
//! Metadata and extra-info sections share one byte form: a sequence of
//! `u32-BE key_len || key || u32-BE value_len || value` entries with UTF-8
//! keys and values, in insertion order, parsed until the section is
//! exhausted. Insertion order is part of the contract, so the map is backed
//! by a `Vec` rather than a hash map; lookups are linear, which is fine for
//! the handful of entries these sections carry.

use crate::errors::{ProtocolError, Result};

/// Insertion-ordered string map with a canonical wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvMap {
    entries: Vec<(String, String)>,
}

impl KvMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key/value pair.
    ///
    /// Re-inserting an existing key replaces its value in place, keeping
    /// the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look up a value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize to the canonical wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.extend_from_slice(&(key.len() as u32).to_be_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    /// Parse the canonical wire form, consuming the whole section.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedFrame`] on truncated entries or non-UTF-8
    /// keys/values.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut map = Self::new();
        while !bytes.is_empty() {
            let (key, rest) = take_string(bytes, "key")?;
            let (value, rest) = take_string(rest, "value")?;
            bytes = rest;
            map.entries.push((key, value));
        }
        Ok(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KvMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

fn take_string<'a>(bytes: &'a [u8], what: &str) -> Result<(String, &'a [u8])> {
    let len_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::malformed(format!("truncated {what} length")))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let rest = &bytes[4..];

    let raw = rest
        .get(..len)
        .ok_or_else(|| ProtocolError::malformed(format!("truncated {what} of {len} bytes")))?;
    let text = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::malformed(format!("{what} is not valid UTF-8")))?;

    Ok((text.to_owned(), &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_insertion_order() {
        let mut map = KvMap::new();
        map.insert("zulu", "1");
        map.insert("alpha", "2");
        map.insert("mike", "3");

        let decoded = KvMap::decode(&map.encode()).unwrap();
        let order: Vec<_> = decoded.iter().map(|(k, _)| k.to_owned()).collect();
        assert_eq!(order, ["zulu", "alpha", "mike"]);
        assert_eq!(decoded, map);
    }

    #[test]
    fn empty_map_encodes_to_nothing() {
        assert!(KvMap::new().encode().is_empty());
        assert_eq!(KvMap::decode(&[]).unwrap(), KvMap::new());
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut map = KvMap::new();
        map.insert("room", "lobby");
        map.insert("user", "alice");
        map.insert("room", "den");

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("room"), Some("den"));
        assert_eq!(map.iter().next().map(|(k, _)| k), Some("room"));
    }

    #[test]
    fn unicode_values_survive() {
        let map: KvMap = [("greeting", "héllo wörld"), ("emoji", "🦀")].into_iter().collect();
        assert_eq!(KvMap::decode(&map.encode()).unwrap(), map);
    }

    #[test]
    fn truncated_entry_rejected() {
        let mut bytes = KvMap::from_iter([("k", "v")]).encode();
        bytes.pop();
        assert!(matches!(KvMap::decode(&bytes), Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn oversize_length_word_rejected() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(b"xy");
        assert!(matches!(KvMap::decode(&bytes), Err(ProtocolError::MalformedFrame(_))));
    }

    #[test]
    fn non_utf8_key_rejected() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(KvMap::decode(&bytes), Err(ProtocolError::MalformedFrame(_))));
    }
}
