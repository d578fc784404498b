use crate::report::UsageRecord;
use std::collections::BTreeSet;

/// Records contributed by one compiled source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Compiled file as spelled in the manifest
    pub source_key: String,
    pub records: Vec<UsageRecord>,
}

/// In-memory stack usage index, one entry per source key.
///
/// Every mutation replaces a whole entry (or everything), so a re-parsed
/// report never leaves stale records behind.
#[derive(Debug, Default)]
pub struct UsageIndex {
    entries: Vec<SourceEntry>,
}

impl UsageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entry for `source_key` and returns every declared path
    /// that lost or gained records (old ∪ new).
    pub fn apply(&mut self, source_key: &str, records: Vec<UsageRecord>) -> BTreeSet<String> {
        let mut affected: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|entry| entry.source_key == source_key)
            .flat_map(|entry| entry.records.iter())
            .map(|record| record.declared_path.clone())
            .collect();
        affected.extend(records.iter().map(|record| record.declared_path.clone()));

        self.entries.retain(|entry| entry.source_key != source_key);
        self.entries.push(SourceEntry {
            source_key: source_key.to_string(),
            records,
        });
        affected
    }

    /// Drops every entry. Callers re-render everything visible afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// All records declared for `path`, in entry order then record order
    pub fn query(&self, path: &str) -> Vec<&UsageRecord> {
        self.entries
            .iter()
            .flat_map(|entry| entry.records.iter())
            .filter(|record| record.declared_path == path)
            .collect()
    }

    pub fn entry(&self, source_key: &str) -> Option<&SourceEntry> {
        self.entries
            .iter()
            .find(|entry| entry.source_key == source_key)
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    /// Total number of records across all entries
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.records.is_empty())
    }

    pub fn source_count(&self) -> usize {
        self.entries.len()
    }
}
