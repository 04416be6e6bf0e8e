//! Core value types shared by the record store, the tracker and the journal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::Result;

/// Field name that carries a resource's identity.
pub const ID_FIELD: &str = "id";

/// A partial set of fields merged into a resource by `update`.
pub type Patch = Map<String, Value>;

/// Identifier of a resource. Ids are either integers or strings, and the two
/// never compare equal (`1` is not `"1"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
  Int(i64),
  Text(String),
}

impl RecordId {
  /// Canonical JSON text used as the `id` column.
  pub fn to_key(&self) -> String {
    match self {
      Self::Int(n) => n.to_string(),
      Self::Text(s) => Value::String(s.clone()).to_string(),
    }
  }

  /// Inverse of [`RecordId::to_key`].
  pub fn from_key(key: &str) -> Result<Self> {
    Ok(serde_json::from_str(key)?)
  }

  /// Parse a user-typed id: numeric input becomes an integer id.
  pub fn parse_lenient(input: &str) -> Self {
    input
      .parse::<i64>()
      .map(Self::Int)
      .unwrap_or_else(|_| Self::Text(input.to_string()))
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Int(n) => write!(f, "{}", n),
      Self::Text(s) => write!(f, "{}", s),
    }
  }
}

impl From<i64> for RecordId {
  fn from(n: i64) -> Self {
    Self::Int(n)
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self {
    Self::Text(s.to_string())
  }
}

impl From<String> for RecordId {
  fn from(s: String) -> Self {
    Self::Text(s)
  }
}

/// An application resource: an id plus named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  pub id: RecordId,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Resource {
  pub fn new(id: impl Into<RecordId>) -> Self {
    Self {
      id: id.into(),
      fields: Map::new(),
    }
  }

  pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.set(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  /// Set a field. Writing `id` is ignored, identity never changes.
  pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    let name = name.into();
    if name != ID_FIELD {
      self.fields.insert(name, value.into());
    }
  }

  /// Merge top-level fields from `patch`; fields not named in it are kept.
  pub fn apply_patch(&mut self, patch: &Patch) {
    for (name, value) in patch {
      if name != ID_FIELD {
        self.fields.insert(name.clone(), value.clone());
      }
    }
  }
}

/// Input to `store`: a resource whose id may still have to be generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<RecordId>,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Draft {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    let name = name.into();
    if name != ID_FIELD {
      self.fields.insert(name, value.into());
    }
    self
  }

  /// Turn the draft into a resource, calling `generate` only when no id was given.
  pub fn into_resource(self, generate: impl FnOnce() -> RecordId) -> Resource {
    Resource {
      id: self.id.unwrap_or_else(generate),
      fields: self.fields,
    }
  }
}

impl From<Resource> for Draft {
  fn from(resource: Resource) -> Self {
    Self {
      id: Some(resource.id),
      fields: resource.fields,
    }
  }
}

/// Which copy of a record a stored row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateTag {
  /// The working copy the application sees and edits.
  Local,
  /// The pre-edit baseline, present only while a change is pending.
  Remote,
}

impl StateTag {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Local => "local",
      Self::Remote => "remote",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "local" => Some(Self::Local),
      "remote" => Some(Self::Remote),
      _ => None,
    }
  }
}

/// One id's view of the cache: its working copy and, while a change is
/// pending, the frozen baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub id: RecordId,
  /// `None` once the record was destroyed locally.
  pub local: Option<Resource>,
  /// Absent when nothing is pending. `Some(None)` is the tombstone
  /// baseline of a record the server does not have yet.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub remote: Option<Option<Resource>>,
}

impl CacheEntry {
  pub fn has_pending_change(&self) -> bool {
    self.remote.is_some()
  }

  pub fn is_pending_create(&self) -> bool {
    matches!(self.remote, Some(None))
  }

  pub fn is_pending_destroy(&self) -> bool {
    self.local.is_none() && self.remote.is_some()
  }
}

/// Result of `refresh`: one record or the whole working collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Refreshed {
  One(Option<Resource>),
  Many(Vec<Resource>),
}

impl Refreshed {
  pub fn into_one(self) -> Option<Resource> {
    match self {
      Self::One(resource) => resource,
      Self::Many(_) => None,
    }
  }

  pub fn into_many(self) -> Vec<Resource> {
    match self {
      Self::One(resource) => resource.into_iter().collect(),
      Self::Many(resources) => resources,
    }
  }
}
