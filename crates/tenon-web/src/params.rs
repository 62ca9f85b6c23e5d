//! Per-connection parameters

use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable key/value bag attached to a connection
///
/// Filled by whoever accepts the connection (peer address, listener name)
/// and handed to every interceptor and handler on that connection.
/// Cloning is cheap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    entries: Arc<BTreeMap<String, String>>,
}

impl ParameterMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this map with one more entry
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Look up a value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: Arc::new(
                iter.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_leaves_original_untouched() {
        let base = ParameterMap::new().with("listener", "main");
        let extended = base.with("peer_addr", "127.0.0.1:9");
        assert_eq!(base.len(), 1);
        assert_eq!(extended.get("listener"), Some("main"));
        assert_eq!(extended.get("peer_addr"), Some("127.0.0.1:9"));
        assert_eq!(base.get("peer_addr"), None);
    }

    #[test]
    fn test_collect() {
        let map: ParameterMap = [("b", "2"), ("a", "1")].into_iter().collect();
        let keys: Vec<_> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }
}
