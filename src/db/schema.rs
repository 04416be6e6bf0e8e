//! Storage schema: the shared tables plus per-resource versioned indexes.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fmt;
use tracing::{info, warn};

use crate::error::{CacheError, Result};

/// Tables shared by every resource of a database.
pub const BASE_SCHEMA: &str = r#"
-- Dual-state rows, one per (resource, scope, target, id)
CREATE TABLE IF NOT EXISTS records (
    resource TEXT NOT NULL,
    scope TEXT NOT NULL,
    target TEXT NOT NULL CHECK (target IN ('local', 'remote')),
    id TEXT NOT NULL,
    body TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (resource, scope, target, id)
);

CREATE INDEX IF NOT EXISTS idx_records_id ON records(resource, id);

-- Canonical parameters behind each scope digest
CREATE TABLE IF NOT EXISTS scopes (
    resource TEXT NOT NULL,
    scope TEXT NOT NULL,
    params TEXT NOT NULL,
    first_seen TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (resource, scope)
);

-- Pending mutations, replayed in seq order
CREATE TABLE IF NOT EXISTS deltas (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    resource TEXT NOT NULL,
    id TEXT NOT NULL,
    op TEXT NOT NULL,
    payload TEXT,
    written_at TEXT NOT NULL,
    UNIQUE (resource, id)
);

-- Highest schema version applied per resource
CREATE TABLE IF NOT EXISTS schema_versions (
    resource TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Check that `name` is usable inside SQL identifiers and file names.
pub fn validate_identifier(name: &str) -> Result<()> {
  let valid = !name.is_empty()
    && name.len() <= 64
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(CacheError::InvalidName(name.to_string()))
  }
}

/// Name of a logical collection, validated once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName(String);

impl ResourceName {
  pub fn new(name: impl Into<String>) -> Result<Self> {
    let name = name.into();
    validate_identifier(&name)?;
    Ok(Self(name))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Routine run inside the migration transaction after a version's indexes exist.
pub type UpgradeFn = fn(&Transaction<'_>, &ResourceName) -> rusqlite::Result<()>;

/// One step of a resource's schema history.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
  pub version: u32,
  /// Resource fields that get an expression index.
  pub indexed_fields: Vec<String>,
  pub upgrade: Option<UpgradeFn>,
}

impl SchemaVersion {
  pub fn new(version: u32) -> Self {
    Self {
      version,
      indexed_fields: Vec::new(),
      upgrade: None,
    }
  }

  pub fn with_index(mut self, field: impl Into<String>) -> Self {
    self.indexed_fields.push(field.into());
    self
  }

  pub fn with_upgrade(mut self, upgrade: UpgradeFn) -> Self {
    self.upgrade = Some(upgrade);
    self
  }
}

/// Create the shared tables.
pub fn run_base_migrations(conn: &Connection) -> Result<()> {
  conn.execute_batch(BASE_SCHEMA)?;
  Ok(())
}

/// Bring `resource` up to the last version in `versions`.
///
/// Versions at or below the recorded one are skipped. An empty list behaves
/// like a single version 1 without indexes. Returns the resulting version.
pub fn apply_resource_schema(
  conn: &mut Connection,
  resource: &ResourceName,
  versions: &[SchemaVersion],
) -> Result<u32> {
  let defaulted = versions.is_empty();
  let default_versions = [SchemaVersion::new(1)];
  let versions = if defaulted {
    &default_versions[..]
  } else {
    versions
  };

  if let Some(pair) = versions
    .windows(2)
    .find(|pair| pair[0].version >= pair[1].version)
  {
    return Err(CacheError::Schema(format!(
      "{}: versions must be strictly ascending ({} then {})",
      resource, pair[0].version, pair[1].version
    )));
  }
  for version in versions {
    for field in &version.indexed_fields {
      validate_identifier(field)?;
    }
  }

  let tx = conn.transaction()?;
  let mut current: u32 = tx
    .query_row(
      "SELECT version FROM schema_versions WHERE resource = ?",
      params![resource.as_str()],
      |row| row.get(0),
    )
    .optional()?
    .unwrap_or(0);

  for version in versions {
    if version.version <= current {
      if version.version < current && !defaulted {
        warn!(
          resource = %resource,
          version = version.version,
          current,
          "skipping schema version below the applied one"
        );
      }
      continue;
    }

    for field in &version.indexed_fields {
      tx.execute_batch(&index_sql(resource, field))?;
    }
    if let Some(upgrade) = version.upgrade {
      upgrade(&tx, resource)?;
    }

    tx.execute(
      "INSERT INTO schema_versions (resource, version, applied_at)
       VALUES (?, ?, datetime('now'))
       ON CONFLICT(resource) DO UPDATE SET version = excluded.version, applied_at = excluded.applied_at",
      params![resource.as_str(), version.version],
    )?;
    info!(resource = %resource, version = version.version, "applied schema version");
    current = version.version;
  }

  tx.commit()?;
  Ok(current)
}

/// Index name for one resource field. The resource length prefix keeps
/// `a_b`+`c` and `a`+`b_c` apart.
fn index_name(resource: &ResourceName, field: &str) -> String {
  format!("idx_{}_{}_{}", resource.as_str().len(), resource, field)
}

// Both names are validated identifiers, so interpolation is safe.
fn index_sql(resource: &ResourceName, field: &str) -> String {
  format!(
    "CREATE INDEX IF NOT EXISTS {name} ON records (resource, json_extract(body, '$.{f}'))
     WHERE resource = '{r}'",
    name = index_name(resource, field),
    r = resource.as_str(),
    f = field,
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    run_base_migrations(&conn).unwrap();
    conn
  }

  fn index_names(conn: &Connection, prefix: &str) -> Vec<String> {
    let mut stmt = conn
      .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND substr(name, 1, length(?1)) = ?1 ORDER BY name")
      .unwrap();
    stmt
      .query_map([prefix], |row| row.get(0))
      .unwrap()
      .collect::<rusqlite::Result<Vec<String>>>()
      .unwrap()
  }

  #[test]
  fn test_validate_identifier() {
    assert!(validate_identifier("todos_2").is_ok());
    assert!(validate_identifier("").is_err());
    assert!(validate_identifier("todos; DROP TABLE records").is_err());
    assert!(ResourceName::new("a-b").is_err());
  }

  #[test]
  fn test_empty_schema_applies_version_one() {
    let mut conn = conn();
    let todos = ResourceName::new("todos").unwrap();
    assert_eq!(apply_resource_schema(&mut conn, &todos, &[]).unwrap(), 1);
    assert!(index_names(&conn, "idx_5_todos_").is_empty());
  }

  #[test]
  fn test_versions_create_indexes_once() {
    let mut conn = conn();
    let todos = ResourceName::new("todos").unwrap();
    let versions = vec![
      SchemaVersion::new(1).with_index("title"),
      SchemaVersion::new(2).with_index("done"),
    ];

    assert_eq!(apply_resource_schema(&mut conn, &todos, &versions).unwrap(), 2);
    assert_eq!(
      index_names(&conn, "idx_5_todos_"),
      vec!["idx_5_todos_done", "idx_5_todos_title"]
    );

    // Re-applying is a no-op.
    assert_eq!(apply_resource_schema(&mut conn, &todos, &versions).unwrap(), 2);
  }

  #[test]
  fn test_upgrade_runs_only_for_new_versions() {
    fn mark_done(tx: &Transaction<'_>, resource: &ResourceName) -> rusqlite::Result<()> {
      tx.execute(
        "UPDATE records SET body = json_set(body, '$.done', json('false')) WHERE resource = ?",
        params![resource.as_str()],
      )?;
      Ok(())
    }

    let mut conn = conn();
    let todos = ResourceName::new("todos").unwrap();
    apply_resource_schema(&mut conn, &todos, &[SchemaVersion::new(1)]).unwrap();
    conn
      .execute(
        "INSERT INTO records (resource, scope, target, id, body) VALUES ('todos', 's', 'local', '1', '{\"id\":1}')",
        [],
      )
      .unwrap();

    let versions = vec![
      SchemaVersion::new(1),
      SchemaVersion::new(2).with_upgrade(mark_done),
    ];
    assert_eq!(apply_resource_schema(&mut conn, &todos, &versions).unwrap(), 2);

    let body: String = conn
      .query_row("SELECT body FROM records WHERE id = '1'", [], |row| row.get(0))
      .unwrap();
    assert_eq!(body, r#"{"id":1,"done":false}"#);
  }

  #[test]
  fn test_index_names_do_not_collide() {
    let mut conn = conn();
    let a_b = ResourceName::new("a_b").unwrap();
    let a = ResourceName::new("a").unwrap();
    apply_resource_schema(&mut conn, &a_b, &[SchemaVersion::new(1).with_index("c")]).unwrap();
    apply_resource_schema(&mut conn, &a, &[SchemaVersion::new(1).with_index("b_c")]).unwrap();

    assert_eq!(index_names(&conn, "idx_3_a_b_"), vec!["idx_3_a_b_c"]);
    assert_eq!(index_names(&conn, "idx_1_a_"), vec!["idx_1_a_b_c"]);
  }

  #[test]
  fn test_non_ascending_versions_rejected() {
    let mut conn = conn();
    let todos = ResourceName::new("todos").unwrap();
    let err = apply_resource_schema(
      &mut conn,
      &todos,
      &[SchemaVersion::new(2), SchemaVersion::new(1)],
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::Schema(_)));
  }

  #[test]
  fn test_invalid_index_field_rejected() {
    let mut conn = conn();
    let todos = ResourceName::new("todos").unwrap();
    let err = apply_resource_schema(
      &mut conn,
      &todos,
      &[SchemaVersion::new(1).with_index("a.b")],
    )
    .unwrap_err();
    assert!(matches!(err, CacheError::InvalidName(_)));
  }
}
