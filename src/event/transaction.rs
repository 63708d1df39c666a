use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A committed write to a single stream at a specific revision.
///
/// Identity is `(stream_id, revision)`, globally unique. Within the canonical
/// journal the revisions of a stream form a dense sequence starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction<E> {
    /// Commit wall-clock timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Coarse subscription-level classifier shared by many streams.
    pub category: String,
    /// Identifier of the logical stream this write belongs to.
    pub stream_id: String,
    /// 0-based monotonic index within the stream.
    pub revision: u64,
    /// Opaque key/value annotations carried alongside the events.
    pub metadata: BTreeMap<String, String>,
    /// Events committed by this write, in commit order.
    pub events: Vec<E>,
}

impl<E> Transaction<E> {
    /// Builds a transaction without metadata.
    pub fn new(
        timestamp_ms: u64,
        category: impl Into<String>,
        stream_id: impl Into<String>,
        revision: u64,
        events: Vec<E>,
    ) -> Self {
        Self {
            timestamp_ms,
            category: category.into(),
            stream_id: stream_id.into(),
            revision,
            metadata: BTreeMap::new(),
            events,
        }
    }

    /// Attaches a metadata entry, returning the transaction for chaining.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Journal sort key across categories.
    pub fn journal_key(&self) -> (u64, &str, u64) {
        (self.timestamp_ms, self.stream_id.as_str(), self.revision)
    }
}

/// Subscription-level category filter. An empty filter matches every category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFilter {
    categories: BTreeSet<String>,
}

impl CategoryFilter {
    /// Filter that admits all categories.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter restricted to the given categories.
    pub fn of(categories: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the filter admits every category.
    pub fn is_all(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn matches(&self, category: &str) -> bool {
        self.categories.is_empty() || self.categories.contains(category)
    }

    /// Categories named by the filter, in lexicographic order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(String::as_str)
    }
}

/// A consumer's declared interest in a stream's history, replacing the legacy
/// `-1` expected-revision sentinel with a tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionInterest {
    /// Only new events matter; any revision is accepted as in-sequence and the
    /// stream is never tracked.
    IgnoreHistory,
    /// The next revision the consumer expects for the stream.
    Track(u64),
}
