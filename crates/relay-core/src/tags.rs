//! Cache tag names shared by readers and writers.
//!
//! Readers store results under tags and writers invalidate them by name, so
//! both sides should build tags here rather than formatting strings by hand.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// A stable cache tag name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheTag(String);

impl CacheTag {
    /// Tag for an arbitrary name. Prefer the typed builders below.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// List-level tag, e.g. `properties`.
    pub fn list(kind: &str) -> Self {
        Self(kind.to_owned())
    }

    /// Entity-level tag, e.g. `property-7`.
    pub fn entity(kind: &str, id: impl fmt::Display) -> Self {
        Self(format!("{kind}-{id}"))
    }

    /// User-scoped tag, e.g. `my-properties-99`.
    pub fn user_scoped(kind: &str, user_id: impl fmt::Display) -> Self {
        Self(format!("my-{kind}-{user_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Deduplicated set of cache tags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<CacheTag>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: impl Into<CacheTag>) -> bool {
        self.0.insert(tag.into())
    }

    pub fn with(mut self, tag: impl Into<CacheTag>) -> Self {
        self.insert(tag);
        self
    }

    pub fn contains(&self, tag: &CacheTag) -> bool {
        self.0.contains(tag)
    }

    /// Whether the two sets share at least one tag.
    pub fn intersects(&self, other: &TagSet) -> bool {
        self.0.iter().any(|tag| other.0.contains(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheTag> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|tag| tag.0.clone()).collect()
    }
}

impl From<CacheTag> for TagSet {
    fn from(tag: CacheTag) -> Self {
        Self::new().with(tag)
    }
}

impl<T: Into<CacheTag>> FromIterator<T> for TagSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<CacheTag>, const N: usize> From<[T; N]> for TagSet {
    fn from(tags: [T; N]) -> Self {
        tags.into_iter().collect()
    }
}

impl From<Vec<CacheTag>> for TagSet {
    fn from(tags: Vec<CacheTag>) -> Self {
        tags.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a CacheTag;
    type IntoIter = std::collections::btree_set::Iter<'a, CacheTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_render_conventional_names() {
        assert_eq!(CacheTag::list("properties").as_str(), "properties");
        assert_eq!(CacheTag::entity("property", 7).as_str(), "property-7");
        assert_eq!(
            CacheTag::user_scoped("properties", 99).as_str(),
            "my-properties-99"
        );
    }

    #[test]
    fn tag_set_deduplicates() {
        let tags = TagSet::from(["properties", "property-7", "properties"]);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.names(), vec!["properties", "property-7"]);
    }

    #[test]
    fn intersection_detects_shared_tags() {
        let read = TagSet::from([CacheTag::entity("property", 7)]);
        let write = TagSet::from([CacheTag::list("properties"), CacheTag::entity("property", 7)]);
        let other = TagSet::from([CacheTag::user_scoped("properties", 99)]);

        assert!(read.intersects(&write));
        assert!(!other.intersects(&write));
    }
}
