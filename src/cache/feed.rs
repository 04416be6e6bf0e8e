//! Live views over a resource scope.

use tokio::sync::broadcast;

use super::layer::ResourceActions;
use super::types::CacheEntry;
use crate::db::{wait_for_change, ChangeEvent, ChangeTable};
use crate::error::Result;

/// Push-driven `get_cache()` for one resource scope.
///
/// The first `next` yields the current entries; later calls wait until a row
/// of the scope changes and yield the fresh entries.
pub struct CacheFeed {
  actions: ResourceActions,
  rx: broadcast::Receiver<ChangeEvent>,
  primed: bool,
}

impl CacheFeed {
  pub(crate) fn new(actions: ResourceActions, rx: broadcast::Receiver<ChangeEvent>) -> Self {
    Self {
      actions,
      rx,
      primed: false,
    }
  }

  pub async fn next(&mut self) -> Option<Result<Vec<CacheEntry>>> {
    if self.primed {
      let resource = self.actions.resource().as_str();
      let scope = self.actions.scope().digest();
      let changed = wait_for_change(&mut self.rx, |event| {
        event.table == ChangeTable::Records
          && event.resource == resource
          && event.scope.as_deref() == Some(scope)
      })
      .await;
      if !changed {
        return None;
      }
    }
    self.primed = true;
    Some(self.actions.get_cache().await)
  }
}

/// Returned by listener hooks that have nothing to attach to offline.
#[derive(Debug, Default)]
#[must_use = "dropping the handle is the same as unregistering"]
pub struct ListenerHandle {
  _private: (),
}

impl ListenerHandle {
  pub(crate) fn noop() -> Self {
    Self::default()
  }

  /// Detach the listener. Always succeeds.
  pub fn unregister(self) {}
}
