//! In-process record of the worker versions a connection has registered.
//!
//! Unlike runs and attempts, worker version bundles never touch the `Store`:
//! they live only as long as the connection that registered them, so a
//! `DashMap` keyed by `workerId` is enough — no persistence, no locking
//! beyond what the map already gives. Resolution by id is the hot path (the
//! dispatch loop and completion handler both resolve a pinned run's worker
//! version this way), so the map is keyed for a direct read there rather than
//! by the friendly id nothing outside tests looks up by.

use crate::model::BackgroundWorkerVersion;
use dashmap::DashMap;
use uuid::Uuid;

/// Tracks registered worker versions for one environment connection and
/// resolves which version should serve a given task.
pub struct WorkerRegistry {
    by_worker_id: DashMap<Uuid, BackgroundWorkerVersion>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            by_worker_id: DashMap::new(),
        }
    }

    /// Record (or replace) a worker version under its `workerId`.
    pub fn register(&self, version: BackgroundWorkerVersion) {
        self.by_worker_id.insert(version.worker_id, version);
    }

    pub fn lookup_by_id(&self, worker_id: Uuid) -> Option<BackgroundWorkerVersion> {
        self.by_worker_id.get(&worker_id).map(|entry| entry.clone())
    }

    /// The highest registered version, by [`crate::model::compare_versions`].
    /// Ties are broken by whichever was registered last.
    pub fn latest(&self) -> Option<BackgroundWorkerVersion> {
        self.by_worker_id
            .iter()
            .map(|entry| entry.clone())
            .max_by(|a, b| crate::model::compare_versions(&a.version, &b.version))
    }

    pub fn is_empty(&self) -> bool {
        self.by_worker_id.is_empty()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(friendly: &str, version: &str) -> BackgroundWorkerVersion {
        BackgroundWorkerVersion {
            worker_id: Uuid::new_v4(),
            friendly_worker_id: friendly.to_string(),
            version: version.to_string(),
            tasks: vec![],
        }
    }

    #[test]
    fn latest_picks_highest_version_numerically() {
        let registry = WorkerRegistry::new();
        registry.register(version("worker_a", "20240101.2"));
        registry.register(version("worker_b", "20240101.10"));

        let latest = registry.latest().unwrap();
        assert_eq!(latest.friendly_worker_id, "worker_b");
    }

    #[test]
    fn lookup_by_id_returns_registered_version() {
        let registry = WorkerRegistry::new();
        let worker_a = version("worker_a", "20240101.1");
        let worker_id = worker_a.worker_id;
        registry.register(worker_a);

        assert!(registry.lookup_by_id(worker_id).is_some());
        assert!(registry.lookup_by_id(Uuid::new_v4()).is_none());
    }

    #[test]
    fn empty_registry_has_no_latest() {
        let registry = WorkerRegistry::new();
        assert!(registry.latest().is_none());
        assert!(registry.is_empty());
    }
}
