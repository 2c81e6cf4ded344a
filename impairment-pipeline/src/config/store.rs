use arc_swap::{ArcSwap, Guard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::snapshot::ConfigSnapshot;

/// Holds the single live [`ConfigSnapshot`]
///
/// Readers take a lock-free view with [`ConfigStore::load`]; a swap replaces the whole snapshot,
/// so a reader sees either the old or the new one, never a mix.
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    last_version: AtomicU64,
}

impl ConfigStore {
    /// Creates a store publishing `snapshot` as version 1
    pub fn new(mut snapshot: ConfigSnapshot) -> Self {
        snapshot.version = 1;
        Self {
            current: ArcSwap::from_pointee(snapshot),
            last_version: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Guard<Arc<ConfigSnapshot>> {
        self.current.load()
    }

    pub fn load_full(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Publishes `snapshot` under the next version and returns it
    pub fn swap(&self, mut snapshot: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        snapshot.version = self.last_version.fetch_add(1, Ordering::AcqRel) + 1;
        let published = Arc::new(snapshot);
        self.current.store(published.clone());
        published
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_publishes_new_versions() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        assert_eq!(store.version(), 1);

        let mut next = ConfigSnapshot::default();
        next.loss.enabled = true;
        let published = store.swap(next);

        assert_eq!(published.version(), 2);
        assert_eq!(store.version(), 2);
        assert!(store.load().loss.enabled);
    }

    #[test]
    fn readers_keep_their_snapshot_across_swaps() {
        let store = ConfigStore::new(ConfigSnapshot::default());
        let before = store.load_full();

        let mut next = ConfigSnapshot::default();
        next.latency.enabled = true;
        store.swap(next);

        assert!(!before.latency.enabled);
        assert_eq!(before.version(), 1);
        assert!(store.load().latency.enabled);
    }
}
