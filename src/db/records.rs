//! Keyed record store: compound-key access to the `records` table.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::cell::RefCell;

use super::schema::ResourceName;
use super::{ChangeEvent, ChangeKind, ChangeTable};
use crate::cache::{Patch, RecordId, Resource, StateTag};
use crate::error::Result;

/// Compound key of a stored row.
#[derive(Debug, Clone, Copy)]
pub struct RowKey<'a> {
  pub resource: &'a ResourceName,
  pub scope: &'a str,
  pub target: StateTag,
  pub id: &'a RecordId,
}

impl<'a> RowKey<'a> {
  pub fn new(resource: &'a ResourceName, scope: &'a str, target: StateTag, id: &'a RecordId) -> Self {
    Self {
      resource,
      scope,
      target,
      id,
    }
  }
}

/// A row of the `records` table. `body` is `None` for the tombstone baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
  pub resource: ResourceName,
  pub scope: String,
  pub target: StateTag,
  pub id: RecordId,
  pub body: Option<Resource>,
}

impl StoredRow {
  pub fn key(&self) -> RowKey<'_> {
    RowKey::new(&self.resource, &self.scope, self.target, &self.id)
  }
}

/// Which rows of a resource a scan returns.
#[derive(Debug, Clone, Copy)]
pub struct RowFilter<'a> {
  pub resource: &'a ResourceName,
  pub scope: Option<&'a str>,
  pub target: Option<StateTag>,
}

impl<'a> RowFilter<'a> {
  pub fn resource(resource: &'a ResourceName) -> Self {
    Self {
      resource,
      scope: None,
      target: None,
    }
  }

  pub fn in_scope(mut self, scope: &'a str) -> Self {
    self.scope = Some(scope);
    self
  }

  pub fn with_target(mut self, target: StateTag) -> Self {
    self.target = Some(target);
    self
  }
}

/// Operations the cache needs from persistent storage.
pub trait RecordStore {
  /// Insert a row. Fails if the compound key already exists.
  fn add(&self, row: &StoredRow) -> Result<()>;

  fn get(&self, key: RowKey<'_>) -> Result<Option<StoredRow>>;

  /// Merge top-level fields into the row's body. Returns false if no row matched.
  fn update(&self, key: RowKey<'_>, patch: &Patch) -> Result<bool>;

  /// Returns false if no row matched.
  fn delete(&self, key: RowKey<'_>) -> Result<bool>;

  /// Rows matching `filter`, ordered by id then target.
  fn scan(&self, filter: RowFilter<'_>) -> Result<Vec<StoredRow>>;
}

/// An open write transaction. Change events are buffered and only handed
/// back to the database once the transaction commits.
pub struct StoreTxn<'c> {
  tx: Transaction<'c>,
  events: RefCell<Vec<ChangeEvent>>,
}

impl<'c> StoreTxn<'c> {
  pub(crate) fn begin(conn: &'c mut Connection) -> Result<Self> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    Ok(Self {
      tx,
      events: RefCell::new(Vec::new()),
    })
  }

  pub(crate) fn commit(self) -> Result<Vec<ChangeEvent>> {
    self.tx.commit()?;
    Ok(self.events.into_inner())
  }

  pub fn conn(&self) -> &Connection {
    &self.tx
  }

  pub(crate) fn emit(&self, event: ChangeEvent) {
    self.events.borrow_mut().push(event);
  }

  fn emit_record(&self, key: RowKey<'_>, kind: ChangeKind) {
    self.emit(ChangeEvent {
      table: ChangeTable::Records,
      resource: key.resource.to_string(),
      scope: Some(key.scope.to_string()),
      id: key.id.clone(),
      kind,
    });
  }

  /// Remember the canonical parameters behind a scope digest.
  pub(crate) fn register_scope(&self, resource: &ResourceName, digest: &str, canonical: &str) -> Result<()> {
    self.tx.execute(
      "INSERT OR IGNORE INTO scopes (resource, scope, params) VALUES (?, ?, ?)",
      params![resource.as_str(), digest, canonical],
    )?;
    Ok(())
  }
}

impl RecordStore for StoreTxn<'_> {
  fn add(&self, row: &StoredRow) -> Result<()> {
    let body = row.body.as_ref().map(serde_json::to_string).transpose()?;
    self.tx.execute(
      "INSERT INTO records (resource, scope, target, id, body, updated_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![
        row.resource.as_str(),
        row.scope,
        row.target.as_str(),
        row.id.to_key(),
        body
      ],
    )?;
    self.emit_record(row.key(), ChangeKind::Added);
    Ok(())
  }

  fn get(&self, key: RowKey<'_>) -> Result<Option<StoredRow>> {
    let body: Option<Option<String>> = self
      .tx
      .query_row(
        "SELECT body FROM records
         WHERE resource = ? AND scope = ? AND target = ? AND id = ?",
        params![
          key.resource.as_str(),
          key.scope,
          key.target.as_str(),
          key.id.to_key()
        ],
        |row| row.get(0),
      )
      .optional()?;

    match body {
      Some(body) => Ok(Some(StoredRow {
        resource: key.resource.clone(),
        scope: key.scope.to_string(),
        target: key.target,
        id: key.id.clone(),
        body: parse_body(body.as_deref())?,
      })),
      None => Ok(None),
    }
  }

  fn update(&self, key: RowKey<'_>, patch: &Patch) -> Result<bool> {
    let Some(row) = self.get(key)? else {
      return Ok(false);
    };

    // A tombstone has no fields yet; patching it starts from the bare id.
    let mut body = row.body.unwrap_or_else(|| Resource::new(key.id.clone()));
    body.apply_patch(patch);
    let data = serde_json::to_string(&body)?;

    self.tx.execute(
      "UPDATE records SET body = ?, updated_at = datetime('now')
       WHERE resource = ? AND scope = ? AND target = ? AND id = ?",
      params![
        data,
        key.resource.as_str(),
        key.scope,
        key.target.as_str(),
        key.id.to_key()
      ],
    )?;
    self.emit_record(key, ChangeKind::Updated);
    Ok(true)
  }

  fn delete(&self, key: RowKey<'_>) -> Result<bool> {
    let deleted = self.tx.execute(
      "DELETE FROM records WHERE resource = ? AND scope = ? AND target = ? AND id = ?",
      params![
        key.resource.as_str(),
        key.scope,
        key.target.as_str(),
        key.id.to_key()
      ],
    )?;
    if deleted > 0 {
      self.emit_record(key, ChangeKind::Deleted);
    }
    Ok(deleted > 0)
  }

  fn scan(&self, filter: RowFilter<'_>) -> Result<Vec<StoredRow>> {
    let mut stmt = self.tx.prepare(
      "SELECT scope, target, id, body FROM records
       WHERE resource = ?1
         AND (?2 IS NULL OR scope = ?2)
         AND (?3 IS NULL OR target = ?3)",
    )?;

    let raw: Vec<(String, String, String, Option<String>)> = stmt
      .query_map(
        params![
          filter.resource.as_str(),
          filter.scope,
          filter.target.map(StateTag::as_str)
        ],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )?
      .collect::<rusqlite::Result<_>>()?;

    raw
      .into_iter()
      .filter_map(|(scope, target, id, body)| {
        // The CHECK constraint keeps target to the two known tags.
        let target = StateTag::parse(&target)?;
        Some((scope, target, id, body))
      })
      .map(|(scope, target, id, body)| {
        Ok(StoredRow {
          resource: filter.resource.clone(),
          scope,
          target,
          id: RecordId::from_key(&id)?,
          body: parse_body(body.as_deref())?,
        })
      })
      .collect::<Result<Vec<_>>>()
      .map(|mut rows| {
        // The id column holds key text, so ordering happens on decoded ids.
        rows.sort_by(|a, b| {
          a.id
            .cmp(&b.id)
            .then_with(|| a.target.as_str().cmp(b.target.as_str()))
        });
        rows
      })
  }
}

fn parse_body(body: Option<&str>) -> Result<Option<Resource>> {
  Ok(body.map(serde_json::from_str).transpose()?)
}
