//! Bounded, deduplicated, most-recent-first list of searched cities.

use crate::storage::KeyValueStore;

/// Storage key for the serialized history.
pub const HISTORY_KEY: &str = "weather.history";

pub const HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    entries: Vec<String>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary entries, restoring the dedup and size invariants.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut history = Self::new();
        let entries: Vec<String> = entries.into_iter().map(|s| s.as_ref().to_string()).collect();
        // Oldest first so the first entry ends up at the front.
        for entry in entries.iter().rev() {
            history.record(entry);
        }
        history
    }

    /// Load from `store`. Missing, unreadable or malformed data gives an
    /// empty history.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let raw = match store.get(HISTORY_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::new(),
            Err(err) => {
                tracing::debug!(error = %err, "could not read search history");
                return Self::new();
            }
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(entries) => Self::from_entries(entries),
            Err(err) => {
                tracing::debug!(error = %err, "discarding malformed search history");
                Self::new()
            }
        }
    }

    /// Overwrite the stored value with the full list.
    pub fn persist(&self, store: &dyn KeyValueStore) -> anyhow::Result<()> {
        let json = serde_json::to_string(&self.entries)?;
        store.set(HISTORY_KEY, &json)
    }

    /// Move `name` to the front, dropping case-insensitive duplicates and
    /// anything past [`HISTORY_LIMIT`]. Returns `false` for a blank name.
    pub fn record(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }

        let lower = name.to_lowercase();
        self.entries.retain(|e| e.to_lowercase() != lower);
        self.entries.insert(0, name.to_string());
        self.entries.truncate(HISTORY_LIMIT);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
