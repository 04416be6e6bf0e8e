//! Scope keys: one cached result set per distinct set of query parameters.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Identifies the query context a collection was fetched under.
///
/// Two fetches with equal parameters share a key regardless of field order;
/// different parameters never produce the same canonical text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
  canonical: String,
  digest: String,
}

impl ScopeKey {
  /// Key for any serializable parameter set.
  pub fn from_params<P: Serialize + ?Sized>(params: &P) -> Result<Self> {
    let value = serde_json::to_value(params)?;
    Ok(Self::from_value(&value))
  }

  pub fn from_value(value: &Value) -> Self {
    let canonical = canonicalize(value).to_string();
    let digest = hash_canonical(&canonical);
    Self { canonical, digest }
  }

  /// Key for "no parameters".
  pub fn root() -> Self {
    Self::from_value(&Value::Null)
  }

  /// Canonical JSON serialization of the parameters.
  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// Fixed-length key stored in the `scope` column.
  pub fn digest(&self) -> &str {
    &self.digest
  }
}

impl Default for ScopeKey {
  fn default() -> Self {
    Self::root()
  }
}

/// Rebuild objects with keys in sorted order, recursively.
fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      let mut sorted = Map::new();
      for (key, inner) in entries {
        sorted.insert(key.clone(), canonicalize(inner));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

// SHA256 hash for stable, fixed-length keys
fn hash_canonical(canonical: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(canonical.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_field_order_does_not_matter() {
    let a = ScopeKey::from_value(&json!({"status": "open", "page": 1}));
    let b = ScopeKey::from_value(&json!({"page": 1, "status": "open"}));
    assert_eq!(a, b);
    assert_eq!(a.canonical(), r#"{"page":1,"status":"open"}"#);
  }

  #[test]
  fn test_nested_objects_are_canonical() {
    let a = ScopeKey::from_value(&json!({"filter": {"b": 1, "a": [{"y": 1, "x": 2}]}}));
    assert_eq!(a.canonical(), r#"{"filter":{"a":[{"x":2,"y":1}],"b":1}}"#);
  }

  #[test]
  fn test_different_params_differ() {
    let open = ScopeKey::from_value(&json!({"status": "open"}));
    let closed = ScopeKey::from_value(&json!({"status": "closed"}));
    let string_one = ScopeKey::from_value(&json!({"page": "1"}));
    let int_one = ScopeKey::from_value(&json!({"page": 1}));

    assert_ne!(open.digest(), closed.digest());
    assert_ne!(string_one, int_one);
  }

  #[test]
  fn test_from_params_struct() {
    #[derive(Serialize)]
    struct Params {
      project: &'static str,
      archived: bool,
    }

    let key = ScopeKey::from_params(&Params {
      project: "core",
      archived: false,
    })
    .unwrap();
    assert_eq!(key.canonical(), r#"{"archived":false,"project":"core"}"#);
    assert_eq!(key.digest().len(), 64);
  }

  #[test]
  fn test_root_scope() {
    assert_eq!(ScopeKey::root().canonical(), "null");
    assert_eq!(ScopeKey::default(), ScopeKey::root());
  }
}
