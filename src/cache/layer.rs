//! Action pipeline: the store/update/destroy/refresh/sync surface that ties
//! the tracker, the materializer and the journal to the record store.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::feed::{CacheFeed, ListenerHandle};
use super::materialize::{group_entries, working_view};
use super::scope::ScopeKey;
use super::tracker::{self, BaselineCapture};
use super::traits::{IdGenerator, UuidGenerator};
use super::types::{CacheEntry, Draft, Patch, RecordId, Refreshed, Resource, StateTag};
use crate::db::records::{RecordStore, RowFilter, RowKey, StoreTxn};
use crate::db::schema::{ResourceName, SchemaVersion};
use crate::db::Database;
use crate::error::{CacheError, Result};
use crate::journal::{self, Delta, DeltaOp, Journal};

/// Per-resource behaviour of the cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// Keep a `remote` baseline for every pending change.
  pub track_baselines: bool,
  /// Also record every mutation in the delta journal.
  pub journal: bool,
  /// Schema history applied before the resource is first read.
  pub schema: Vec<SchemaVersion>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      track_baselines: true,
      journal: false,
      schema: Vec::new(),
    }
  }
}

impl CacheOptions {
  pub fn with_track_baselines(mut self, enabled: bool) -> Self {
    self.track_baselines = enabled;
    self
  }

  pub fn with_journal(mut self, enabled: bool) -> Self {
    self.journal = enabled;
    self
  }

  pub fn with_schema(mut self, schema: Vec<SchemaVersion>) -> Self {
    self.schema = schema;
    self
  }
}

/// Entry point: hands out [`ResourceActions`] for named resources of one database.
#[derive(Clone)]
pub struct Cache {
  db: Database,
  ids: Arc<dyn IdGenerator>,
}

impl Cache {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      ids: Arc::new(UuidGenerator),
    }
  }

  /// Replace the generator used for drafts stored without an id.
  pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
    self.ids = Arc::new(ids);
    self
  }

  pub fn database(&self) -> &Database {
    &self.db
  }

  pub fn journal(&self) -> Journal {
    Journal::new(self.db.clone())
  }

  /// Actions for `name` in the root scope. Applies the resource schema first.
  pub fn resource(&self, name: &str, options: &CacheOptions) -> Result<ResourceActions> {
    let resource = ResourceName::new(name)?;
    self.db.apply_schema(&resource, &options.schema)?;

    Ok(ResourceActions {
      db: self.db.clone(),
      ids: Arc::clone(&self.ids),
      binding: Arc::new(Binding {
        resource,
        scope: ScopeKey::root(),
        track_baselines: options.track_baselines,
        journal: options.journal,
      }),
    })
  }
}

/// Where an action applies and how. Shared by the blocking storage closures.
#[derive(Debug)]
struct Binding {
  resource: ResourceName,
  scope: ScopeKey,
  track_baselines: bool,
  journal: bool,
}

impl Binding {
  fn local_key<'a>(&'a self, id: &'a RecordId) -> RowKey<'a> {
    RowKey::new(&self.resource, self.scope.digest(), StateTag::Local, id)
  }

  fn record_delta(&self, txn: &StoreTxn<'_>, id: &RecordId, op: DeltaOp, body: Option<&Resource>) -> Result<()> {
    if !self.journal {
      return Ok(());
    }
    let delta = Delta {
      resource: self.resource.to_string(),
      id: id.clone(),
      op,
      payload: body.map(serde_json::to_value).transpose()?,
    };
    journal::upsert(txn, &self.resource, &delta)?;
    Ok(())
  }

  fn store_in(&self, txn: &StoreTxn<'_>, value: &Resource) -> Result<BaselineCapture> {
    txn.register_scope(&self.resource, self.scope.digest(), self.scope.canonical())?;
    let capture = tracker::seed_creation(
      txn,
      &self.resource,
      self.scope.digest(),
      value,
      self.track_baselines,
    )?;
    self.record_delta(txn, &value.id, DeltaOp::Create, Some(value))?;
    Ok(capture)
  }

  fn update_in(&self, txn: &StoreTxn<'_>, id: &RecordId, patch: &Patch) -> Result<(Resource, BaselineCapture)> {
    let (_, capture) = tracker::prepare_mutation(
      txn,
      &self.resource,
      self.scope.digest(),
      id,
      self.track_baselines,
    )?;
    txn.update(self.local_key(id), patch)?;

    let updated = txn
      .get(self.local_key(id))?
      .and_then(|row| row.body)
      .ok_or_else(|| CacheError::not_found(self.resource.as_str(), id))?;
    self.record_delta(txn, id, DeltaOp::Update, Some(&updated))?;
    Ok((updated, capture))
  }

  fn destroy_in(&self, txn: &StoreTxn<'_>, id: &RecordId) -> Result<BaselineCapture> {
    let (_, capture) = tracker::prepare_mutation(
      txn,
      &self.resource,
      self.scope.digest(),
      id,
      self.track_baselines,
    )?;
    txn.delete(self.local_key(id))?;
    self.record_delta(txn, id, DeltaOp::Destroy, None)?;
    Ok(capture)
  }

  fn sync_in(&self, txn: &StoreTxn<'_>, ids: &[RecordId]) -> Result<usize> {
    let mut cleared = 0;
    for id in ids {
      if tracker::clear_baseline(txn, &self.resource, self.scope.digest(), id)? {
        cleared += 1;
      }
      if self.journal {
        journal::remove(txn, &self.resource, id)?;
      }
    }
    Ok(cleared)
  }

  fn scope_filter(&self) -> RowFilter<'_> {
    RowFilter::resource(&self.resource).in_scope(self.scope.digest())
  }
}

/// Operations on one resource within one scope.
///
/// Every single-item operation runs in its own storage transaction, so the
/// baseline capture and the mutation it guards are applied together, and
/// operations on the same id are serialized.
#[derive(Clone)]
pub struct ResourceActions {
  db: Database,
  ids: Arc<dyn IdGenerator>,
  binding: Arc<Binding>,
}

impl ResourceActions {
  pub fn resource(&self) -> &ResourceName {
    &self.binding.resource
  }

  pub fn scope(&self) -> &ScopeKey {
    &self.binding.scope
  }

  /// The same resource bound to the scope derived from `params`.
  pub fn scoped<P: Serialize + ?Sized>(&self, params: &P) -> Result<Self> {
    let scope = ScopeKey::from_params(params)?;
    Ok(Self {
      db: self.db.clone(),
      ids: Arc::clone(&self.ids),
      binding: Arc::new(Binding {
        resource: self.binding.resource.clone(),
        scope,
        track_baselines: self.binding.track_baselines,
        journal: self.binding.journal,
      }),
    })
  }

  /// Create a record. Ids missing from the draft are generated.
  ///
  /// Storing an id that already has a local row fails with a storage error.
  pub async fn store(&self, draft: Draft) -> Result<Resource> {
    let value = draft.into_resource(|| self.ids.next_id());
    let binding = Arc::clone(&self.binding);
    debug!(resource = %binding.resource, id = %value.id, "store");

    self
      .db
      .transact(move |txn| {
        binding.store_in(txn, &value)?;
        Ok(value)
      })
      .await
  }

  /// Store every draft concurrently; results keep the input order.
  ///
  /// Every item runs to completion and commits on its own. If any fail, the
  /// first failure in input order is returned and the other items stay stored.
  pub async fn batch_store(&self, drafts: Vec<Draft>) -> Result<Vec<Resource>> {
    join_all(drafts.into_iter().map(|draft| self.store(draft)))
      .await
      .into_iter()
      .collect()
  }

  /// Merge `patch` into the local copy of `id` and return the result.
  ///
  /// Fields not named in the patch are unchanged; an `id` key is ignored.
  pub async fn update(&self, id: &RecordId, patch: Patch) -> Result<Resource> {
    let binding = Arc::clone(&self.binding);
    let id = id.clone();
    debug!(resource = %binding.resource, id = %id, "update");

    let (updated, capture) = self
      .db
      .transact(move |txn| binding.update_in(txn, &id, &patch))
      .await?;
    debug!(resource = %self.binding.resource, ?capture, "update applied");
    Ok(updated)
  }

  /// Update every `(id, patch)` pair concurrently; results keep the input order.
  ///
  /// Every item runs to completion and commits on its own. If any fail, the
  /// first failure in input order is returned and the other items stay updated.
  pub async fn batch_update(&self, items: Vec<(RecordId, Patch)>) -> Result<Vec<Resource>> {
    join_all(
      items
        .into_iter()
        .map(|(id, patch)| async move { self.update(&id, patch).await }),
    )
    .await
    .into_iter()
    .collect()
  }

  /// Remove `id` from the working view. Its baseline stays until `sync`.
  pub async fn destroy(&self, id: &RecordId) -> Result<()> {
    let binding = Arc::clone(&self.binding);
    let id = id.clone();
    debug!(resource = %binding.resource, id = %id, "destroy");

    self
      .db
      .transact(move |txn| binding.destroy_in(txn, &id))
      .await?;
    Ok(())
  }

  /// Destroy every id concurrently.
  ///
  /// Every item runs to completion and commits on its own. If any fail, the
  /// first failure in input order is returned and the other ids stay destroyed.
  pub async fn batch_destroy(&self, ids: &[RecordId]) -> Result<()> {
    join_all(ids.iter().map(|id| self.destroy(id)))
      .await
      .into_iter()
      .collect()
  }

  /// Read the working view: one record, or the whole scope when `id` is `None`.
  /// Never leaves the local store.
  pub async fn refresh(&self, id: Option<&RecordId>) -> Result<Refreshed> {
    match id {
      Some(id) => Ok(Refreshed::One(self.refresh_one(id).await?)),
      None => Ok(Refreshed::Many(self.refresh_all().await?)),
    }
  }

  pub async fn refresh_one(&self, id: &RecordId) -> Result<Option<Resource>> {
    let binding = Arc::clone(&self.binding);
    let id = id.clone();
    self
      .db
      .transact(move |txn| Ok(txn.get(binding.local_key(&id))?.and_then(|row| row.body)))
      .await
  }

  /// Every local record of the scope, ordered by id.
  pub async fn refresh_all(&self) -> Result<Vec<Resource>> {
    let binding = Arc::clone(&self.binding);
    self
      .db
      .transact(move |txn| {
        let rows = txn.scan(binding.scope_filter().with_target(StateTag::Local))?;
        Ok(working_view(rows))
      })
      .await
  }

  /// Mark `ids` as reconciled with the server: their baselines are dropped
  /// (and their journal entries flushed when journaling is on). Ids without
  /// a pending change are ignored. All ids are cleared in one transaction.
  pub async fn sync(&self, ids: &[RecordId]) -> Result<()> {
    let binding = Arc::clone(&self.binding);
    let ids = ids.to_vec();
    let requested = ids.len();

    let cleared = self
      .db
      .transact(move |txn| binding.sync_in(txn, &ids))
      .await?;
    info!(resource = %self.binding.resource, requested, cleared, "synced");
    Ok(())
  }

  /// Every id of the scope with its working copy and pending baseline.
  pub async fn get_cache(&self) -> Result<Vec<CacheEntry>> {
    let binding = Arc::clone(&self.binding);
    self
      .db
      .transact(move |txn| Ok(group_entries(txn.scan(binding.scope_filter())?)))
      .await
  }

  /// Server-side filtering has no offline equivalent; always fails.
  pub async fn query<P: Serialize + ?Sized>(&self, _params: &P) -> Result<Vec<Resource>> {
    Err(CacheError::Unsupported("query"))
  }

  /// Connectivity listeners have nothing to attach to in a local store.
  /// `callback` is never called; the handle unregisters nothing.
  pub fn add_offline_listener<F>(&self, _callback: F) -> ListenerHandle
  where
    F: Fn(bool) + Send + 'static,
  {
    ListenerHandle::noop()
  }

  /// Live `get_cache()` that updates whenever a row of this scope changes.
  pub fn watch(&self) -> CacheFeed {
    CacheFeed::new(self.clone(), self.db.subscribe())
  }

  /// Canonical parameters of every scope this resource has stored into.
  pub async fn scopes(&self) -> Result<Vec<String>> {
    let binding = Arc::clone(&self.binding);
    self
      .db
      .transact(move |txn| {
        let mut stmt = txn
          .conn()
          .prepare("SELECT params FROM scopes WHERE resource = ? ORDER BY first_seen, params")?;
        let params = stmt
          .query_map([binding.resource.as_str()], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(params)
      })
      .await
  }
}
