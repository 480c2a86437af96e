use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{Result, UpdaterError};

/// Per-component install locks, created on first use.
///
/// Acquisition never waits: a held lock fails with
/// [`UpdaterError::InstallInProgress`] so callers can report contention instead
/// of queueing behind a running install.
#[derive(Debug, Default, Clone)]
pub struct InstallLocks {
    table: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `component_id` or fail immediately.
    pub fn try_acquire(&self, component_id: &str) -> Result<InstallGuard> {
        let slot = {
            let mut table = self.table.lock();
            table
                .entry(component_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = slot
            .try_lock_owned()
            .map_err(|_| UpdaterError::InstallInProgress(component_id.to_string()))?;
        trace!(target: "updater", component = component_id, "install lock acquired");
        Ok(InstallGuard {
            component_id: component_id.to_string(),
            _guard: guard,
        })
    }

    /// Whether an install of `component_id` currently holds the lock.
    pub fn is_locked(&self, component_id: &str) -> bool {
        self.table
            .lock()
            .get(component_id)
            .map_or(false, |slot| slot.try_lock().is_err())
    }
}

/// Held for the whole install; dropping it releases the component.
#[derive(Debug)]
pub struct InstallGuard {
    component_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl InstallGuard {
    pub fn component_id(&self) -> &str {
        &self.component_id
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        trace!(target: "updater", component = %self.component_id, "install lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = InstallLocks::new();
        let guard = locks.try_acquire("demo").unwrap();
        assert_eq!(guard.component_id(), "demo");
        assert!(locks.is_locked("demo"));

        let err = locks.try_acquire("demo").unwrap_err();
        assert!(matches!(err, UpdaterError::InstallInProgress(ref id) if id == "demo"));

        drop(guard);
        assert!(!locks.is_locked("demo"));
        assert!(locks.try_acquire("demo").is_ok());
    }

    #[test]
    fn distinct_components_do_not_contend() {
        let locks = InstallLocks::new();
        let _a = locks.try_acquire("a").unwrap();
        let _b = locks.clone().try_acquire("b").unwrap();
        assert!(locks.try_acquire("a").is_err());
    }
}
