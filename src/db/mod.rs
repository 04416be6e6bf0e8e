pub mod records;
pub mod schema;

use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::RecordId;
use crate::error::{CacheError, Result};
use records::StoreTxn;
use schema::{apply_resource_schema, run_base_migrations, validate_identifier, ResourceName, SchemaVersion};

/// Capacity of the change channel; slow subscribers see `Lagged` and re-read.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Table a change happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTable {
  Records,
  Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Added,
  Updated,
  Deleted,
}

/// Notification sent after a transaction that touched a row commits.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub table: ChangeTable,
  pub resource: String,
  /// Scope digest for record changes, `None` for journal changes.
  pub scope: Option<String>,
  pub id: RecordId,
  pub kind: ChangeKind,
}

struct Inner {
  name: String,
  conn: Mutex<Connection>,
  changes: broadcast::Sender<ChangeEvent>,
}

/// Shared handle to one cache database.
///
/// Cloning is cheap; all clones use the same connection and change channel.
#[derive(Clone)]
pub struct Database {
  inner: Arc<Inner>,
}

impl Database {
  /// Open or create the database file at `path`.
  pub fn open(name: &str, path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    info!(name, path = %path.display(), "opened cache database");
    Self::from_connection(name, conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory(name: &str) -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    debug!(name, "opened in-memory cache database");
    Self::from_connection(name, conn)
  }

  fn from_connection(name: &str, conn: Connection) -> Result<Self> {
    run_base_migrations(&conn)?;
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
    Ok(Self {
      inner: Arc::new(Inner {
        name: name.to_string(),
        conn: Mutex::new(conn),
        changes,
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// True if both handles refer to the same open database.
  pub fn same_handle(&self, other: &Database) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .inner
      .conn
      .lock()
      .map_err(|e| CacheError::Lock(e.to_string()))
  }

  /// Apply a resource's schema versions. Must complete before the resource is read.
  pub fn apply_schema(&self, resource: &ResourceName, versions: &[SchemaVersion]) -> Result<u32> {
    let mut conn = self.lock()?;
    apply_resource_schema(&mut conn, resource, versions)
  }

  /// Run `f` inside one immediate transaction while holding the connection.
  ///
  /// Commits when `f` succeeds and rolls back otherwise. Change events are
  /// published only after the commit.
  pub fn with_transaction<R>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<R>) -> Result<R> {
    let (out, events) = {
      let mut conn = self.lock()?;
      let txn = StoreTxn::begin(&mut conn)?;
      let out = f(&txn)?;
      (out, txn.commit()?)
    };

    for event in events {
      // No subscribers is fine.
      let _ = self.inner.changes.send(event);
    }
    Ok(out)
  }

  /// [`Database::with_transaction`] on the blocking pool, so async callers
  /// suspend instead of blocking the runtime.
  pub async fn transact<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&StoreTxn<'_>) -> Result<R> + Send + 'static,
  {
    let db = self.clone();
    tokio::task::spawn_blocking(move || db.with_transaction(f)).await?
  }

  /// Subscribe to change notifications for every resource of this database.
  pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
    self.inner.changes.subscribe()
  }
}

/// Wait until an event matching `wanted` arrives.
///
/// Returns false once the channel is closed. A lagged receiver reports true,
/// since the caller re-reads state anyway.
pub(crate) async fn wait_for_change(
  rx: &mut broadcast::Receiver<ChangeEvent>,
  wanted: impl Fn(&ChangeEvent) -> bool,
) -> bool {
  loop {
    match rx.recv().await {
      Ok(event) if wanted(&event) => return true,
      Ok(_) => continue,
      Err(broadcast::error::RecvError::Lagged(_)) => return true,
      Err(broadcast::error::RecvError::Closed) => return false,
    }
  }
}

enum Location {
  Directory(PathBuf),
  Memory,
}

/// Opens each named database once and hands out the shared handle afterwards.
pub struct DatabaseRegistry {
  location: Location,
  handles: Mutex<HashMap<String, Database>>,
}

impl DatabaseRegistry {
  /// Registry storing `<dir>/<name>.db` files.
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      location: Location::Directory(dir.into()),
      handles: Mutex::new(HashMap::new()),
    }
  }

  /// Registry whose databases live in memory only.
  pub fn in_memory() -> Self {
    Self {
      location: Location::Memory,
      handles: Mutex::new(HashMap::new()),
    }
  }

  /// Get the default data directory.
  pub fn default_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        CacheError::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        ))
      })?;

    Ok(data_dir.join("rescache"))
  }

  fn handles(&self) -> Result<MutexGuard<'_, HashMap<String, Database>>> {
    self
      .handles
      .lock()
      .map_err(|e| CacheError::Lock(e.to_string()))
  }

  /// Return the handle for `name`, opening the database on first use.
  pub fn open(&self, name: &str) -> Result<Database> {
    validate_identifier(name)?;
    let mut handles = self.handles()?;
    if let Some(db) = handles.get(name) {
      return Ok(db.clone());
    }

    let db = match &self.location {
      Location::Directory(dir) => Database::open(name, &dir.join(format!("{}.db", name)))?,
      Location::Memory => Database::open_in_memory(name)?,
    };
    handles.insert(name.to_string(), db.clone());
    Ok(db)
  }

  /// Drop the registry's handle. Clones held elsewhere stay usable.
  pub fn close(&self, name: &str) -> Result<bool> {
    Ok(self.handles()?.remove(name).is_some())
  }

  pub fn close_all(&self) -> Result<()> {
    self.handles()?.clear();
    Ok(())
  }
}
