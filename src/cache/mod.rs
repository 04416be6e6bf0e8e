//! Dual-state resource cache.
//!
//! Every record has a `local` working copy and, while a change is pending,
//! a `remote` baseline holding what the server had before the first
//! unsynchronized edit:
//! - `store` creates the local row plus a tombstone baseline
//! - `update`/`destroy` capture the baseline once, then change the local row
//! - `sync` drops baselines after the server accepted the change
//! - `get_cache` exposes both copies so callers can diff or roll back

mod feed;
mod layer;
mod materialize;
mod scope;
pub mod tracker;
mod traits;
mod types;

pub use feed::{CacheFeed, ListenerHandle};
pub use layer::{Cache, CacheOptions, ResourceActions};
pub use materialize::{group_entries, working_view};
pub use scope::ScopeKey;
pub use traits::{IdGenerator, UuidGenerator};
pub use types::{CacheEntry, Draft, Patch, RecordId, Refreshed, Resource, StateTag, ID_FIELD};
