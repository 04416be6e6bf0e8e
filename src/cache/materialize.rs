//! Folding stored rows into the consumer-visible view.

use indexmap::IndexMap;

use super::types::{CacheEntry, RecordId, Resource, StateTag};
use crate::db::records::StoredRow;

/// Group rows by id into one entry each, in a single pass.
///
/// Entries keep the order in which their ids first appear in `rows`.
pub fn group_entries(rows: Vec<StoredRow>) -> Vec<CacheEntry> {
  let mut entries: IndexMap<RecordId, CacheEntry> = IndexMap::with_capacity(rows.len());

  for row in rows {
    let entry = entries
      .entry(row.id.clone())
      .or_insert_with(|| CacheEntry {
        id: row.id,
        local: None,
        remote: None,
      });
    match row.target {
      StateTag::Local => entry.local = row.body,
      StateTag::Remote => entry.remote = Some(row.body),
    }
  }

  entries.into_values().collect()
}

/// The working view: local bodies only. Rows with just a baseline (pending
/// deletions) are not part of it.
pub fn working_view(rows: Vec<StoredRow>) -> Vec<Resource> {
  rows
    .into_iter()
    .filter(|row| row.target == StateTag::Local)
    .filter_map(|row| row.body)
    .collect()
}
