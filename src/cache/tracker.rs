//! Dirty-state tracking: capture the pre-edit baseline before the working
//! copy changes, exactly once per pending change.
//!
//! Every function here expects to run inside a single store transaction so
//! the check-then-write on the `remote` row is atomic.

use tracing::debug;

use super::types::{RecordId, Resource, StateTag};
use crate::db::records::{RecordStore, RowKey, StoredRow};
use crate::db::schema::ResourceName;
use crate::error::{CacheError, Result};

/// What happened to the baseline during a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineCapture {
  /// A new `remote` row was written from the current local value.
  Captured,
  /// A change was already pending; its baseline stays frozen.
  AlreadyPending,
  /// Baseline tracking is turned off.
  Disabled,
}

/// Make sure `id` has a local row and a baseline before it is mutated.
///
/// Returns the current local value. Fails with `NotFound` when there is no
/// local row, whether or not tracking is enabled.
pub fn prepare_mutation<S: RecordStore + ?Sized>(
  store: &S,
  resource: &ResourceName,
  scope: &str,
  id: &RecordId,
  track_baselines: bool,
) -> Result<(Resource, BaselineCapture)> {
  let current = store
    .get(RowKey::new(resource, scope, StateTag::Local, id))?
    .and_then(|row| row.body)
    .ok_or_else(|| CacheError::not_found(resource.as_str(), id))?;

  if !track_baselines {
    return Ok((current, BaselineCapture::Disabled));
  }

  if store
    .get(RowKey::new(resource, scope, StateTag::Remote, id))?
    .is_some()
  {
    return Ok((current, BaselineCapture::AlreadyPending));
  }

  store.add(&StoredRow {
    resource: resource.clone(),
    scope: scope.to_string(),
    target: StateTag::Remote,
    id: id.clone(),
    body: Some(current.clone()),
  })?;
  debug!(resource = %resource, id = %id, "captured baseline");
  Ok((current, BaselineCapture::Captured))
}

/// Create the local row of a new record, and its tombstone baseline.
///
/// If a baseline already exists (the id was destroyed and is being created
/// again before a sync), it is kept: it still describes the server state.
/// A second local row for the same id is a storage constraint error.
pub fn seed_creation<S: RecordStore + ?Sized>(
  store: &S,
  resource: &ResourceName,
  scope: &str,
  value: &Resource,
  track_baselines: bool,
) -> Result<BaselineCapture> {
  store.add(&StoredRow {
    resource: resource.clone(),
    scope: scope.to_string(),
    target: StateTag::Local,
    id: value.id.clone(),
    body: Some(value.clone()),
  })?;

  if !track_baselines {
    return Ok(BaselineCapture::Disabled);
  }

  if store
    .get(RowKey::new(resource, scope, StateTag::Remote, &value.id))?
    .is_some()
  {
    return Ok(BaselineCapture::AlreadyPending);
  }

  store.add(&StoredRow {
    resource: resource.clone(),
    scope: scope.to_string(),
    target: StateTag::Remote,
    id: value.id.clone(),
    body: None,
  })?;
  Ok(BaselineCapture::Captured)
}

/// Drop the baseline of `id`, marking its pending change as reconciled.
pub fn clear_baseline<S: RecordStore + ?Sized>(
  store: &S,
  resource: &ResourceName,
  scope: &str,
  id: &RecordId,
) -> Result<bool> {
  store.delete(RowKey::new(resource, scope, StateTag::Remote, id))
}
