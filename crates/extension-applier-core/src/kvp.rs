//! Small helpers for merging Kubernetes label/annotation maps.
//!
//! This is a deliberately narrower cousin of the teacher crate's `kvp`
//! module: that module validates individual keys and values against the
//! Kubernetes label/annotation character-set rules via a generic
//! `KeyValuePair<V: Value>` machinery. The applier core never constructs
//! labels or annotations from free-form user input that needs that
//! validation — every key it writes is one of the constants in
//! [`crate::constants`], and every value either comes from the extension's
//! own name/namespace (already validated by the API server that admitted
//! the `ClusterExtension`) or is merged through verbatim from caller input.
//! What's kept from the teacher's module is the shape: an ordered map with
//! a `merge` that encodes "caller wins".

use std::collections::BTreeMap;

/// An ordered string-to-string map used for both labels and annotations.
///
/// Kept as a thin wrapper (rather than a bare `BTreeMap`) so call sites read
/// as label/annotation operations rather than generic map munging, matching
/// the intent behind the teacher's `Labels`/`Annotations` newtypes.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct KvMap(BTreeMap<String, String>);

impl KvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Merges `other` into `self`, with `other` winning on key collisions.
    ///
    /// This is the one operation the spec actually names ("caller-supplied
    /// wins on collisions" in the Sanitizer, §4.2): everywhere the applier
    /// core merges two label/annotation sets, the more-specific/more-recent
    /// one is the "other" argument.
    pub fn merge(mut self, other: &KvMap) -> Self {
        for (key, value) in other.iter() {
            self.0.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn retain(&mut self, mut predicate: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|k, v| predicate(k, v));
    }
}

impl From<BTreeMap<String, String>> for KvMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for KvMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for KvMap {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
