//! Pluggable collaborators of the cache layer.

use super::types::RecordId;

/// Supplies ids for resources stored without one.
pub trait IdGenerator: Send + Sync {
  fn next_id(&self) -> RecordId;
}

/// Random UUID v4 string ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn next_id(&self) -> RecordId {
    RecordId::Text(uuid::Uuid::new_v4().to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_uuid_ids_are_unique_strings() {
    let ids = UuidGenerator;
    let a = ids.next_id();
    let b = ids.next_id();
    assert_ne!(a, b);
    assert!(matches!(a, RecordId::Text(ref s) if s.len() == 36));
  }
}
