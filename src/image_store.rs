//! Image lifecycle: composing volumes into a rootfs and tearing it down.
//!
//! An image is a directory under `images/<image-id>` holding the stored
//! image config (`image.json`), the recorded disk limit (`image_quota`),
//! and the driver-managed `rootfs/`, `diff/`, and `workdir/` trees. The
//! ordered volume chain is registered under `meta/dependencies/` so the
//! garbage collector can see what is in use.
//!
//! Creation and deletion hold the `gc` lock shared, which keeps a
//! concurrent collection from sweeping volumes out from under a
//! half-created image.

use std::path::PathBuf;

use crate::driver::{Driver, ImageDriverSpec, VolumeStats};
use crate::error::{Result, StoreError};
use crate::locksmith::LockMode;
use crate::metrics::{MetricSink, Timer};
use crate::store::Store;

/// Stored image configuration filename.
const IMAGE_CONFIG_FILE: &str = "image.json";
/// Recorded disk limit filename.
const IMAGE_QUOTA_FILE: &str = "image_quota";

/// Everything needed to materialize one image.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Caller-supplied image id; becomes the directory name.
    pub image_id: String,
    /// Volume chain in manifest order, base first.
    pub volume_chain: Vec<String>,
    /// Disk limit in bytes; 0 means unlimited.
    pub disk_limit: u64,
    /// Size the quota against the writable layer only.
    pub exclude_image_from_quota: bool,
    /// The OCI image configuration blob, stored verbatim.
    pub config: Vec<u8>,
    /// Ownership applied to the image directories.
    pub owner_uid: u32,
    /// See `owner_uid`.
    pub owner_gid: u32,
}

/// Creates, destroys, and measures images.
pub struct ImageStore<'a> {
    store: &'a Store,
    driver: &'a Driver,
    metrics: &'a dyn MetricSink,
}

impl<'a> ImageStore<'a> {
    /// Create an image store bound to a store and driver.
    pub fn new(store: &'a Store, driver: &'a Driver, metrics: &'a dyn MetricSink) -> Self {
        Self {
            store,
            driver,
            metrics,
        }
    }

    /// Materialize an image from committed volumes. Returns the path of
    /// the writable rootfs.
    pub fn create(&self, spec: &ImageSpec) -> Result<PathBuf> {
        let span = tracing::info_span!("image-create", image_id = %spec.image_id);
        let _entered = span.enter();
        let _timer = Timer::start(self.metrics, "image.create");

        validate_image_id(&spec.image_id)?;
        let _gc = self.store.locksmith().lock("gc", LockMode::Shared)?;

        let image_path = self.store.image_path(&spec.image_id);
        if image_path.exists() {
            return Err(StoreError::AlreadyExists(spec.image_id.clone()));
        }
        std::fs::create_dir(&image_path)?;
        crate::driver::overlayxfs::set_mode(&image_path, 0o700)?;

        match self.populate(spec, &image_path) {
            Ok(()) => {
                tracing::info!("image created");
                Ok(image_path.join(crate::driver::overlayxfs::ROOTFS_DIR))
            }
            Err(e) => {
                // Never leave a half-created image behind.
                let _ = std::fs::remove_dir_all(&image_path);
                let _ = self.store.remove_image_dependencies(&spec.image_id);
                self.metrics.increment("image.create.fail");
                Err(e)
            }
        }
    }

    fn populate(&self, spec: &ImageSpec, image_path: &std::path::Path) -> Result<()> {
        std::fs::write(image_path.join(IMAGE_CONFIG_FILE), &spec.config)?;
        std::fs::write(
            image_path.join(IMAGE_QUOTA_FILE),
            spec.disk_limit.to_string(),
        )?;
        self.store
            .write_image_dependencies(&spec.image_id, &spec.volume_chain)?;

        let mut base_volume_size = 0u64;
        // Overlay wants its lowers topmost-first; the chain is base-first.
        let mut base_volume_paths = Vec::with_capacity(spec.volume_chain.len());
        for volume_id in spec.volume_chain.iter().rev() {
            base_volume_paths.push(self.driver.volume_path(volume_id)?);
            if let Some(sidecar) = self.store.read_volume_meta(volume_id)? {
                base_volume_size += sidecar.size;
            }
        }

        self.driver.create_image(&ImageDriverSpec {
            image_path: image_path.to_path_buf(),
            base_volume_paths,
            base_volume_size,
            disk_limit: spec.disk_limit,
            exclude_image_from_quota: spec.exclude_image_from_quota,
            owner_uid: spec.owner_uid,
            owner_gid: spec.owner_gid,
        })
    }

    /// Destroy an image completely. Deleting an image that does not exist
    /// is success; returns whether anything was removed.
    pub fn delete(&self, image_id: &str) -> Result<bool> {
        let span = tracing::info_span!("image-delete", image_id);
        let _entered = span.enter();
        let _timer = Timer::start(self.metrics, "image.delete");

        validate_image_id(image_id)?;
        let _gc = self.store.locksmith().lock("gc", LockMode::Shared)?;

        let image_path = self.store.image_path(image_id);
        if !image_path.is_dir() {
            tracing::debug!("image absent, nothing to delete");
            return Ok(false);
        }

        self.driver.destroy_image(&image_path)?;
        std::fs::remove_dir_all(&image_path)?;
        self.store.remove_image_dependencies(image_id)?;
        tracing::info!("image deleted");
        Ok(true)
    }

    /// Report an image's disk usage.
    pub fn stats(&self, image_id: &str) -> Result<VolumeStats> {
        validate_image_id(image_id)?;
        let image_path = self.store.image_path(image_id);
        if !image_path.is_dir() {
            return Err(StoreError::ImageNotFound(image_id.to_string()));
        }
        self.driver.stats(&image_path)
    }
}

/// Image ids become path components; refuse anything that would not stay
/// one.
fn validate_image_id(image_id: &str) -> Result<()> {
    let ok = !image_id.is_empty()
        && image_id != "."
        && image_id != ".."
        && !image_id.contains('/')
        && !image_id.contains('\0');
    if !ok {
        return Err(StoreError::ReferenceInvalid {
            reference: image_id.to_string(),
            reason: "invalid image id".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{NoopSink, RecordingSink};
    use crate::store::VolumeMeta;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Store,
        driver: Driver,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::open(dir.path()).unwrap();
            let driver = Driver::fake(dir.path());
            Self {
                _dir: dir,
                store,
                driver,
            }
        }

        /// Commit a volume containing a single file.
        fn volume(&self, id: &str, file: &str, contents: &[u8]) {
            let path = self.driver.create_volume(None, id).unwrap();
            if let Some(parent) = std::path::Path::new(file).parent() {
                std::fs::create_dir_all(path.join(parent)).unwrap();
            }
            std::fs::write(path.join(file), contents).unwrap();
            self.store
                .write_volume_meta(
                    id,
                    &VolumeMeta {
                        size: contents.len() as u64,
                        digest: format!("sha256:{id}"),
                    },
                )
                .unwrap();
        }

        fn spec(&self, image_id: &str, chain: &[&str]) -> ImageSpec {
            ImageSpec {
                image_id: image_id.to_string(),
                volume_chain: chain.iter().map(|s| s.to_string()).collect(),
                disk_limit: 0,
                exclude_image_from_quota: false,
                config: br#"{"architecture":"amd64"}"#.to_vec(),
                owner_uid: 0,
                owner_gid: 0,
            }
        }
    }

    #[test]
    fn create_materializes_rootfs_and_metadata() {
        let h = Harness::new();
        h.volume("base", "etc/os-release", b"ID=test\n");
        h.volume("top", "usr/bin/tool", b"#!/bin/sh\n");

        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        let rootfs = images.create(&h.spec("img1", &["base", "top"])).unwrap();

        assert_eq!(std::fs::read(rootfs.join("etc/os-release")).unwrap(), b"ID=test\n");
        assert_eq!(std::fs::read(rootfs.join("usr/bin/tool")).unwrap(), b"#!/bin/sh\n");

        let image_path = h.store.image_path("img1");
        assert_eq!(
            std::fs::read(image_path.join("image.json")).unwrap(),
            br#"{"architecture":"amd64"}"#
        );
        assert_eq!(std::fs::read_to_string(image_path.join("image_quota")).unwrap(), "0");
        assert_eq!(
            h.store.read_image_dependencies("img1").unwrap().unwrap(),
            vec!["base".to_string(), "top".to_string()]
        );
    }

    #[test]
    fn chain_order_gives_top_layer_precedence() {
        let h = Harness::new();
        h.volume("base", "etc/config", b"base");
        h.volume("top", "etc/config", b"top");

        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        let rootfs = images.create(&h.spec("img1", &["base", "top"])).unwrap();
        assert_eq!(std::fs::read(rootfs.join("etc/config")).unwrap(), b"top");
    }

    #[test]
    fn duplicate_image_id_is_rejected() {
        let h = Harness::new();
        h.volume("base", "f", b"x");

        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        images.create(&h.spec("img1", &["base"])).unwrap();
        assert!(matches!(
            images.create(&h.spec("img1", &["base"])),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn failed_create_cleans_up_the_image_directory() {
        let h = Harness::new();
        let metrics = RecordingSink::new();
        let images = ImageStore::new(&h.store, &h.driver, &metrics);

        // Chain references a volume that was never committed.
        let err = images.create(&h.spec("img1", &["ghost"])).unwrap_err();
        assert!(matches!(err, StoreError::VolumeNotFound(_)));

        assert!(!h.store.image_path("img1").exists());
        assert!(h.store.read_image_dependencies("img1").unwrap().is_none());
        assert_eq!(metrics.counter("image.create.fail"), 1);
    }

    #[test]
    fn delete_is_total_and_idempotent() {
        let h = Harness::new();
        h.volume("base", "f", b"x");

        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        images.create(&h.spec("img1", &["base"])).unwrap();

        assert!(images.delete("img1").unwrap());
        assert!(!h.store.image_path("img1").exists());
        assert!(h.store.read_image_dependencies("img1").unwrap().is_none());

        // Absent image deletes successfully.
        assert!(!images.delete("img1").unwrap());
        assert!(!images.delete("never-existed").unwrap());
    }

    #[test]
    fn stats_reflect_writes_into_the_image() {
        let h = Harness::new();
        h.volume("base", "f", b"0123456789");

        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        images.create(&h.spec("img1", &["base"])).unwrap();

        let stats = images.stats("img1").unwrap();
        assert_eq!(stats.exclusive_bytes_used, 0);
        assert_eq!(stats.total_bytes_used, 10);

        std::fs::write(h.store.image_path("img1").join("diff/new"), vec![1u8; 30]).unwrap();
        let stats = images.stats("img1").unwrap();
        assert_eq!(stats.exclusive_bytes_used, 30);
        assert_eq!(stats.total_bytes_used, 40);
    }

    #[test]
    fn stats_for_missing_image_fail() {
        let h = Harness::new();
        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        assert!(matches!(
            images.stats("nope"),
            Err(StoreError::ImageNotFound(_))
        ));
    }

    #[test]
    fn hostile_image_ids_are_rejected() {
        let h = Harness::new();
        let metrics = NoopSink;
        let images = ImageStore::new(&h.store, &h.driver, &metrics);
        for bad in ["", ".", "..", "a/b", "x\0y"] {
            let err = images.create(&h.spec(bad, &[])).unwrap_err();
            assert!(matches!(err, StoreError::ReferenceInvalid { .. }), "{bad:?}");
        }
    }
}
