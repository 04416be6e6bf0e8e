//! Offline-capable resource cache.
//!
//! Records are kept in SQLite as a working copy plus, while unsynchronized,
//! the server baseline they were edited from. A delta journal records the
//! pending mutations per resource for replay once the server is reachable.
//!
//! ```ignore
//! let registry = DatabaseRegistry::new(DatabaseRegistry::default_dir()?);
//! let cache = Cache::new(registry.open("app")?);
//! let todos = cache.resource("todos", &CacheOptions::default())?;
//!
//! todos.store(Draft::new().with_id("1").with_field("title", "A")).await?;
//! todos.update(&"1".into(), patch).await?;
//! // after the server accepted the change:
//! todos.sync(&["1".into()]).await?;
//! ```

pub mod cache;
pub mod db;
pub mod error;
pub mod journal;

pub use cache::{
  Cache, CacheEntry, CacheFeed, CacheOptions, Draft, IdGenerator, Patch, RecordId, Refreshed,
  Resource, ResourceActions, ScopeKey, StateTag,
};
pub use db::schema::{ResourceName, SchemaVersion};
pub use db::{ChangeEvent, ChangeKind, ChangeTable, Database, DatabaseRegistry};
pub use error::{CacheError, Result};
pub use journal::{Delta, DeltaFeed, DeltaOp, Journal, JournalEntry};
