//! Garbage collection of unreferenced volumes.
//!
//! `collect` takes the `gc` lock exclusively, so it never runs while a
//! create or delete holds it shared. The referenced set comes from the
//! dependency registry the image store maintains; anything not referenced
//! and not on the caller's keep list is destroyed, sidecar first, so an
//! interrupted collection leaves volumes that read as uncommitted rather
//! than committed-but-gone.

use std::collections::HashSet;

use crate::driver::Driver;
use crate::error::Result;
use crate::idmap::IdMappings;
use crate::locksmith::LockMode;
use crate::metrics::{MetricSink, Timer};
use crate::store::Store;
use crate::volume_cache::volume_id;

/// What one collection removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Number of volumes destroyed.
    pub volumes_removed: u64,
    /// Sum of the destroyed volumes' sidecar sizes.
    pub bytes_reclaimed: u64,
}

/// Build the keep set from caller-supplied identifiers.
///
/// Callers may name a layer by digest or by volume id; both forms are
/// honored by keeping the raw value alongside the id derived under the
/// active mapping.
pub fn keep_set(ignored: &[String], mappings: &IdMappings) -> HashSet<String> {
    let mut keep = HashSet::with_capacity(ignored.len() * 2);
    for entry in ignored {
        keep.insert(volume_id(entry, mappings));
        keep.insert(entry.clone());
    }
    keep
}

/// Removes volumes no image references.
pub struct GarbageCollector<'a> {
    store: &'a Store,
    driver: &'a Driver,
    metrics: &'a dyn MetricSink,
}

impl<'a> GarbageCollector<'a> {
    /// Create a collector bound to a store and driver.
    pub fn new(store: &'a Store, driver: &'a Driver, metrics: &'a dyn MetricSink) -> Self {
        Self {
            store,
            driver,
            metrics,
        }
    }

    /// Destroy every volume that is neither referenced by an image nor in
    /// `keep`. With a non-zero `threshold_bytes`, collection only runs
    /// once the committed volumes exceed that many bytes.
    pub fn collect(
        &self,
        keep: &HashSet<String>,
        threshold_bytes: u64,
    ) -> Result<CollectStats> {
        let span = tracing::info_span!("gc");
        let _entered = span.enter();
        let _timer = Timer::start(self.metrics, "gc.collect");

        if threshold_bytes > 0 {
            let committed = self.store.committed_volume_bytes()?;
            if committed <= threshold_bytes {
                tracing::debug!(committed, threshold_bytes, "store below threshold");
                return Ok(CollectStats::default());
            }
        }

        let _gc = self.store.locksmith().lock("gc", LockMode::Exclusive)?;
        let referenced = self.store.referenced_volume_ids()?;

        let mut stats = CollectStats::default();
        for id in self.driver.volumes()? {
            if referenced.contains(&id) || keep.contains(&id) {
                continue;
            }
            let reclaimed = self
                .store
                .read_volume_meta(&id)?
                .map(|m| m.size)
                .unwrap_or(0);
            self.store.remove_volume_meta(&id)?;
            self.driver.destroy_volume(&id)?;
            stats.volumes_removed += 1;
            stats.bytes_reclaimed += reclaimed;
            tracing::debug!(volume = %id, reclaimed, "volume collected");
        }

        self.metrics
            .observe_gauge("gc.volumes_removed", stats.volumes_removed);
        self.metrics
            .observe_gauge("gc.bytes_reclaimed", stats.bytes_reclaimed);
        tracing::info!(
            removed = stats.volumes_removed,
            bytes = stats.bytes_reclaimed,
            "collection finished"
        );
        Ok(stats)
    }
}
