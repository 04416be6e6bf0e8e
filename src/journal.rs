//! Delta journal: pending mutations per resource, replayed in insertion order.
//!
//! One entry exists per (resource, id). A later write for the same key
//! replaces the entry's content but keeps its original position in the
//! queue, so replay order is the order in which ids first became dirty.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::RecordId;
use crate::db::records::StoreTxn;
use crate::db::schema::ResourceName;
use crate::db::{wait_for_change, ChangeEvent, ChangeKind, ChangeTable, Database};
use crate::error::{CacheError, Result};

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
  Create,
  Update,
  Destroy,
}

impl DeltaOp {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Destroy => "destroy",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(Self::Create),
      "update" => Some(Self::Update),
      "destroy" => Some(Self::Destroy),
      _ => None,
    }
  }

  /// Operation to keep when `next` is written over a pending `self`.
  ///
  /// An update to a record the server has not seen yet is still a create,
  /// and recreating a record whose deletion is still pending replaces the
  /// server copy, so it becomes an update.
  pub fn coalesce(self, next: DeltaOp) -> DeltaOp {
    match (self, next) {
      (Self::Create, Self::Update) => Self::Create,
      (Self::Destroy, Self::Create) => Self::Update,
      (_, next) => next,
    }
  }
}

/// A pending mutation against one resource/id pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delta {
  pub resource: String,
  pub id: RecordId,
  pub op: DeltaOp,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
}

impl Delta {
  pub fn new(resource: impl Into<String>, id: impl Into<RecordId>, op: DeltaOp) -> Self {
    Self {
      resource: resource.into(),
      id: id.into(),
      op,
      payload: None,
    }
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = Some(payload);
    self
  }
}

/// A delta as stored, with its queue position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
  pub seq: i64,
  pub written_at: DateTime<Utc>,
  #[serde(flatten)]
  pub delta: Delta,
}

/// Upsert `delta` within an open transaction.
pub(crate) fn upsert(txn: &StoreTxn<'_>, resource: &ResourceName, delta: &Delta) -> Result<JournalEntry> {
  let conn = txn.conn();
  let id_key = delta.id.to_key();

  let previous: Option<String> = conn
    .query_row(
      "SELECT op FROM deltas WHERE resource = ? AND id = ?",
      params![resource.as_str(), id_key],
      |row| row.get(0),
    )
    .optional()?;
  let op = match previous.as_deref().and_then(DeltaOp::parse) {
    Some(pending) => pending.coalesce(delta.op),
    None => delta.op,
  };

  let payload = delta.payload.as_ref().map(Value::to_string);
  let written_at = Utc::now();
  conn.execute(
    "INSERT INTO deltas (resource, id, op, payload, written_at)
     VALUES (?, ?, ?, ?, ?)
     ON CONFLICT(resource, id) DO UPDATE SET
       op = excluded.op,
       payload = excluded.payload,
       written_at = excluded.written_at",
    params![
      resource.as_str(),
      id_key,
      op.as_str(),
      payload,
      written_at.to_rfc3339()
    ],
  )?;
  let seq: i64 = conn.query_row(
    "SELECT seq FROM deltas WHERE resource = ? AND id = ?",
    params![resource.as_str(), id_key],
    |row| row.get(0),
  )?;

  txn.emit(ChangeEvent {
    table: ChangeTable::Journal,
    resource: resource.to_string(),
    scope: None,
    id: delta.id.clone(),
    kind: if previous.is_some() {
      ChangeKind::Updated
    } else {
      ChangeKind::Added
    },
  });

  Ok(JournalEntry {
    seq,
    written_at,
    delta: Delta {
      resource: resource.to_string(),
      id: delta.id.clone(),
      op,
      payload: delta.payload.clone(),
    },
  })
}

/// Remove the entry for `(resource, id)` within an open transaction.
pub(crate) fn remove(txn: &StoreTxn<'_>, resource: &ResourceName, id: &RecordId) -> Result<bool> {
  let deleted = txn.conn().execute(
    "DELETE FROM deltas WHERE resource = ? AND id = ?",
    params![resource.as_str(), id.to_key()],
  )?;
  if deleted > 0 {
    txn.emit(ChangeEvent {
      table: ChangeTable::Journal,
      resource: resource.to_string(),
      scope: None,
      id: id.clone(),
      kind: ChangeKind::Deleted,
    });
  }
  Ok(deleted > 0)
}

fn list(conn: &Connection, resource: &ResourceName) -> Result<Vec<JournalEntry>> {
  let mut stmt = conn.prepare(
    "SELECT seq, id, op, payload, written_at FROM deltas
     WHERE resource = ?
     ORDER BY seq",
  )?;
  let raw: Vec<(i64, String, String, Option<String>, String)> = stmt
    .query_map(params![resource.as_str()], |row| {
      Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    })?
    .collect::<rusqlite::Result<_>>()?;

  raw
    .into_iter()
    .map(|(seq, id, op, payload, written_at)| {
      let op = DeltaOp::parse(&op)
        .ok_or_else(|| CacheError::Schema(format!("unknown delta op '{}' at seq {}", op, seq)))?;
      Ok(JournalEntry {
        seq,
        written_at: parse_timestamp(&written_at)?,
        delta: Delta {
          resource: resource.to_string(),
          id: RecordId::from_key(&id)?,
          op,
          payload: payload.as_deref().map(serde_json::from_str).transpose()?,
        },
      })
    })
    .collect()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| CacheError::Schema(format!("invalid timestamp '{}': {}", s, e)))
}

/// Access to the delta journal of one database.
#[derive(Clone)]
pub struct Journal {
  db: Database,
}

impl Journal {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Upsert the delta for its (resource, id) key.
  pub async fn write(&self, delta: Delta) -> Result<JournalEntry> {
    let resource = ResourceName::new(delta.resource.clone())?;
    debug!(resource = %resource, id = %delta.id, op = delta.op.as_str(), "journal write");
    self
      .db
      .transact(move |txn| upsert(txn, &resource, &delta))
      .await
  }

  /// Current pending deltas of `resource`, oldest first.
  pub async fn pending(&self, resource: &str) -> Result<Vec<JournalEntry>> {
    let resource = ResourceName::new(resource)?;
    self.db.transact(move |txn| list(txn.conn(), &resource)).await
  }

  /// Live view of the pending deltas of `resource`.
  pub fn read(&self, resource: &str) -> Result<DeltaFeed> {
    Ok(DeltaFeed {
      journal: self.clone(),
      resource: ResourceName::new(resource)?,
      rx: self.db.subscribe(),
      primed: false,
    })
  }

  /// Delete the delta for `(resource, id)` once it is applied remotely.
  /// Returns false if nothing was pending.
  pub async fn flush(&self, resource: &str, id: &RecordId) -> Result<bool> {
    let resource = ResourceName::new(resource)?;
    let id = id.clone();
    debug!(resource = %resource, id = %id, "journal flush");
    self
      .db
      .transact(move |txn| remove(txn, &resource, &id))
      .await
  }
}

/// Push-driven sequence of journal snapshots for one resource.
///
/// The first `next` yields the current list; every later call waits for the
/// resource's journal to change and yields the new list.
pub struct DeltaFeed {
  journal: Journal,
  resource: ResourceName,
  rx: broadcast::Receiver<ChangeEvent>,
  primed: bool,
}

impl DeltaFeed {
  pub async fn next(&mut self) -> Option<Result<Vec<JournalEntry>>> {
    if self.primed {
      let resource = self.resource.as_str();
      let changed = wait_for_change(&mut self.rx, |event| {
        event.table == ChangeTable::Journal && event.resource == resource
      })
      .await;
      if !changed {
        return None;
      }
    }
    self.primed = true;
    Some(self.journal.pending(self.resource.as_str()).await)
  }

  pub fn into_stream(self) -> impl Stream<Item = Result<Vec<JournalEntry>>> {
    stream::unfold(self, |mut feed| async move {
      let item = feed.next().await?;
      Some((item, feed))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use serde_json::json;

  fn journal() -> Journal {
    Journal::new(Database::open_in_memory("test").unwrap())
  }

  #[test]
  fn test_coalesce() {
    assert_eq!(DeltaOp::Create.coalesce(DeltaOp::Update), DeltaOp::Create);
    assert_eq!(DeltaOp::Create.coalesce(DeltaOp::Destroy), DeltaOp::Destroy);
    assert_eq!(DeltaOp::Update.coalesce(DeltaOp::Destroy), DeltaOp::Destroy);
    assert_eq!(DeltaOp::Destroy.coalesce(DeltaOp::Create), DeltaOp::Update);
    assert_eq!(DeltaOp::Update.coalesce(DeltaOp::Update), DeltaOp::Update);
  }

  #[tokio::test]
  async fn test_later_write_replaces_content_keeps_position() {
    let journal = journal();
    journal
      .write(Delta::new("todos", "a", DeltaOp::Update).with_payload(json!({"v": 1})))
      .await
      .unwrap();
    journal
      .write(Delta::new("todos", "b", DeltaOp::Create))
      .await
      .unwrap();
    journal
      .write(Delta::new("todos", "a", DeltaOp::Update).with_payload(json!({"v": 2})))
      .await
      .unwrap();

    let pending = journal.pending("todos").await.unwrap();
    let ids: Vec<RecordId> = pending.iter().map(|e| e.delta.id.clone()).collect();
    assert_eq!(ids, vec![RecordId::from("a"), RecordId::from("b")]);
    assert_eq!(pending[0].delta.payload, Some(json!({"v": 2})));
  }

  #[tokio::test]
  async fn test_create_then_update_stays_create() {
    let journal = journal();
    journal.write(Delta::new("todos", 1i64, DeltaOp::Create)).await.unwrap();
    let entry = journal
      .write(Delta::new("todos", 1i64, DeltaOp::Update))
      .await
      .unwrap();
    assert_eq!(entry.delta.op, DeltaOp::Create);
  }

  #[tokio::test]
  async fn test_flush_and_resource_isolation() {
    let journal = journal();
    journal.write(Delta::new("todos", "a", DeltaOp::Destroy)).await.unwrap();
    journal.write(Delta::new("notes", "a", DeltaOp::Create)).await.unwrap();

    assert!(journal.flush("todos", &"a".into()).await.unwrap());
    assert!(!journal.flush("todos", &"a".into()).await.unwrap());
    assert!(journal.pending("todos").await.unwrap().is_empty());
    assert_eq!(journal.pending("notes").await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_invalid_resource_name() {
    let journal = journal();
    let err = journal
      .write(Delta::new("bad name", "a", DeltaOp::Create))
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::InvalidName(_)));
  }

  #[tokio::test]
  async fn test_feed_yields_on_every_change() {
    let journal = journal();
    journal.write(Delta::new("todos", "a", DeltaOp::Create)).await.unwrap();

    let mut feed = journal.read("todos").unwrap();
    assert_eq!(feed.next().await.unwrap().unwrap().len(), 1);

    // Other resources do not wake the feed.
    journal.write(Delta::new("notes", "x", DeltaOp::Create)).await.unwrap();
    journal.write(Delta::new("todos", "b", DeltaOp::Create)).await.unwrap();
    assert_eq!(feed.next().await.unwrap().unwrap().len(), 2);

    journal.flush("todos", &"a".into()).await.unwrap();
    let after_flush = feed.next().await.unwrap().unwrap();
    assert_eq!(after_flush.len(), 1);
    assert_eq!(after_flush[0].delta.id, RecordId::from("b"));
  }

  #[tokio::test]
  async fn test_feed_as_stream() {
    let journal = journal();
    let mut stream = Box::pin(journal.read("todos").unwrap().into_stream());
    assert!(stream.next().await.unwrap().unwrap().is_empty());

    journal.write(Delta::new("todos", "a", DeltaOp::Create)).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);
  }
}
