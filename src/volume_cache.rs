//! Content-addressed cache of unpacked layers.
//!
//! For each layer, in manifest order: take the volume's exclusive lock,
//! skip if the volume is already committed, otherwise unpack into scratch
//! under `tmp/`, claim `volumes/<id>` through the driver, and promote the
//! scratch tree with an atomic rename before writing the sidecar.
//!
//! Because the exclusive lock is taken before the existence check, two
//! invocations racing on the same volume serialize: the loser observes
//! the committed volume and never opens the layer stream. Parent layers
//! always commit before children begin, which the union mount relies on.
//!
//! A volume id mixes the layer digest with the id-mapping fingerprint, so
//! the same layer unpacked under two mappings yields two volumes.

use std::time::Instant;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use sha2::{Digest, Sha256};

use crate::driver::Driver;
use crate::error::{Result, StoreError};
use crate::idmap::IdMappings;
use crate::locksmith::LockMode;
use crate::metrics::{MetricSink, Timer};
use crate::source::{Layer, LayerSource};
use crate::store::{Store, VolumeMeta};
use crate::unpack::{UnpackOptions, Unpacker, UnpackStats};
use crate::userns_helper;

/// Derive the volume id for a layer under a mapping.
pub fn volume_id(digest: &str, mappings: &IdMappings) -> String {
    let mut hasher = Sha256::new();
    hasher.update(digest.as_bytes());
    hasher.update(b":");
    hasher.update(mappings.fingerprint().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Materializes layers into committed volumes, at most once each.
pub struct VolumeCache<'a> {
    store: &'a Store,
    driver: &'a Driver,
    mappings: &'a IdMappings,
    metrics: &'a dyn MetricSink,
}

impl<'a> VolumeCache<'a> {
    /// Create a cache bound to a store and driver.
    pub fn new(
        store: &'a Store,
        driver: &'a Driver,
        mappings: &'a IdMappings,
        metrics: &'a dyn MetricSink,
    ) -> Self {
        Self {
            store,
            driver,
            mappings,
            metrics,
        }
    }

    /// Ensure a committed volume exists for every layer, in order.
    /// Returns the volume ids, base first.
    ///
    /// The deadline is honored between layers: in-flight I/O always runs
    /// to completion, and an elapsed deadline rolls the current scratch
    /// back before returning.
    pub fn provide(
        &self,
        source: &dyn LayerSource,
        layers: &[Layer],
        deadline: Option<Instant>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(layers.len());
        for layer in layers {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(StoreError::DeadlineExceeded);
            }
            let id = volume_id(&layer.digest, self.mappings);
            self.provide_one(source, layer, &id)?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn provide_one(&self, source: &dyn LayerSource, layer: &Layer, id: &str) -> Result<()> {
        let span = tracing::debug_span!("volume", id, digest = %layer.digest);
        let _entered = span.enter();

        let _lock = self
            .store
            .locksmith()
            .lock(&format!("volume-{id}"), LockMode::Exclusive)?;

        if self.store.volume_committed(id)? {
            tracing::debug!("volume already committed");
            self.metrics.increment("volume.cache.hit");
            return Ok(());
        }
        self.metrics.increment("volume.cache.miss");

        // A directory without a valid sidecar is leftover from a crashed
        // invocation; clear it so the claim below can succeed.
        self.driver.destroy_volume(id)?;

        let _timer = Timer::start(self.metrics, "volume.unpack");
        let scratch = self.store.create_scratch()?;
        let stats = match self.unpack_into(source, layer, scratch.path()) {
            Ok(stats) => stats,
            Err(e) => {
                // Dropping the scratch handle removes the partial tree.
                self.metrics.increment("volume.unpack.fail");
                return Err(e);
            }
        };

        let volume_path = self.driver.create_volume(None, id)?;
        let scratch_path = scratch.keep();
        if let Err(e) = std::fs::rename(&scratch_path, &volume_path) {
            let _ = std::fs::remove_dir_all(&scratch_path);
            let _ = self.driver.destroy_volume(id);
            return Err(e.into());
        }

        self.store.write_volume_meta(
            id,
            &VolumeMeta {
                size: stats.bytes_on_disk,
                digest: layer.digest.clone(),
            },
        )?;
        tracing::info!(bytes = stats.bytes_on_disk, "volume committed");
        Ok(())
    }

    fn unpack_into(
        &self,
        source: &dyn LayerSource,
        layer: &Layer,
        target: &std::path::Path,
    ) -> Result<UnpackStats> {
        let blob = source.blob(layer)?;

        if userns_helper::needs_helper(self.mappings) {
            return userns_helper::spawn_unpack_helper(target, &layer.digest, self.mappings, blob);
        }

        let target = Dir::open_ambient_dir(target, ambient_authority())?;
        let unpacker = Unpacker::new(UnpackOptions {
            mappings: self.mappings.clone(),
            preserve_ownership: rustix::process::geteuid().is_root(),
        });
        unpacker.unpack(&layer.digest, blob, &target)
    }
}
