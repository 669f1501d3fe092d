use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

/// Label holding the address of a scrape target, `host:port`.
pub const ADDRESS_LABEL: &str = "__address__";
/// Label holding the URL scheme used to scrape a target.
pub const SCHEME_LABEL: &str = "__scheme__";
/// Label holding the HTTP path metrics are scraped from.
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
/// Label holding the scrape job name.
pub const JOB_LABEL: &str = "job";
/// Label identifying the scraped endpoint on exported samples.
pub const INSTANCE_LABEL: &str = "instance";
/// Prefix for labels carrying URL query parameters.
pub const PARAM_LABEL_PREFIX: &str = "__param_";
/// Prefix for discovery metadata labels, stripped after relabeling.
pub const META_LABEL_PREFIX: &str = "__meta_";
/// Prefix reserved for internal labels.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// A unique identity derived from a [`LabelSet`]. Equal label sets
/// always map to equal fingerprints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A set of labels, unique by name. The underlying map keeps labels
/// sorted by name, which doubles as the canonical order for hashing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get<Q>(&self, name: &Q) -> Option<&str>
    where
        String: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains<Q>(&self, name: &Q) -> bool
    where
        String: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.0.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn remove<Q>(&mut self, name: &Q) -> Option<String>
    where
        String: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.0.remove(name)
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut String) -> bool) {
        self.0.retain(f)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy labels from `defaults` that are not set yet.
    pub fn merge_defaults(&mut self, defaults: &LabelSet) {
        for (name, value) in &defaults.0 {
            if !self.0.contains_key(name) {
                self.0.insert(name.clone(), value.clone());
            }
        }
    }

    /// Hash of the canonical (sorted) label stream. Names and values
    /// are length-prefixed so adjacent labels cannot collide by
    /// concatenation.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Xxh64::new(0);
        for (name, value) in &self.0 {
            hasher.update(&(name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        Fingerprint(hasher.digest())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=\"{}\"", name, value)?;
        }
        f.write_str("}")
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for LabelSet {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().map(|(n, v)| (*n, *v)).collect()
    }

    #[test]
    fn fingerprint_ignores_insert_order() {
        let mut a = LabelSet::new();
        a.insert("job", "node");
        a.insert("__address__", "localhost:9100");

        let mut b = LabelSet::new();
        b.insert("__address__", "localhost:9100");
        b.insert("job", "node");

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_by_value() {
        let a = labels(&[("job", "node")]);
        let b = labels(&[("job", "blackbox")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_no_concat_collision() {
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn merge_defaults_keeps_existing() {
        let mut set = labels(&[("job", "node")]);
        set.merge_defaults(&labels(&[("job", "default"), ("env", "prod")]));

        assert_eq!(set.get("job"), Some("node"));
        assert_eq!(set.get("env"), Some("prod"));
    }

    #[test]
    fn display() {
        let set = labels(&[("b", "2"), ("a", "1")]);
        assert_eq!(set.to_string(), r#"{a="1", b="2"}"#);
    }
}
