//! Filesystem drivers: how volumes and images become real directories
//! and mounts.
//!
//! The driver is a tagged variant behind one operation set; dispatch is
//! explicit at the image-store boundary. The reference backend is
//! [`overlayxfs::OverlayXfs`]; [`fake::FakeDriver`] composes images by
//! copying so the suites can run unprivileged.
//!
//! Volume directories are plain filesystem state shared by every backend;
//! the backends differ in how an image is composed, destroyed, and
//! measured.

pub mod fake;
pub mod overlayxfs;
pub mod quota;

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::store::VOLUMES_DIR;

/// Everything a backend needs to compose one image.
#[derive(Debug, Clone)]
pub struct ImageDriverSpec {
    /// The image directory; must already exist.
    pub image_path: PathBuf,
    /// Lower layers in overlay order: topmost layer first.
    pub base_volume_paths: Vec<PathBuf>,
    /// Combined committed size of the lower layers, in bytes.
    pub base_volume_size: u64,
    /// Disk limit in bytes; 0 means unlimited.
    pub disk_limit: u64,
    /// Size the quota against the writable layer only.
    pub exclude_image_from_quota: bool,
    /// Owner applied to the image directories (0:0 leaves them alone).
    pub owner_uid: u32,
    /// See `owner_uid`.
    pub owner_gid: u32,
}

/// Disk usage reported for one image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct VolumeStats {
    /// Bytes attributable to the whole image, base layers included.
    pub total_bytes_used: u64,
    /// Bytes written through the image's writable layer.
    pub exclusive_bytes_used: u64,
}

/// One of the supported backends.
#[derive(Debug)]
pub enum Backend {
    /// Overlay mounts with XFS project quotas; the production backend.
    OverlayXfs(overlayxfs::OverlayXfs),
    /// Copy-composed images for unprivileged test runs.
    Fake(fake::FakeDriver),
}

/// A backend bound to a store path.
#[derive(Debug)]
pub struct Driver {
    store_path: PathBuf,
    backend: Backend,
}

impl Driver {
    /// The reference overlay-over-XFS driver.
    pub fn overlay_xfs<P: AsRef<Path>>(store_path: P) -> Self {
        let store_path = store_path.as_ref().to_path_buf();
        Self {
            backend: Backend::OverlayXfs(overlayxfs::OverlayXfs::new(&store_path)),
            store_path,
        }
    }

    /// The copy-composing fake.
    pub fn fake<P: AsRef<Path>>(store_path: P) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
            backend: Backend::Fake(fake::FakeDriver::new()),
        }
    }

    /// Access the fake backend's call record; panics on the real backend.
    /// Test-suite convenience.
    pub fn as_fake(&self) -> &fake::FakeDriver {
        match &self.backend {
            Backend::Fake(fake) => fake,
            Backend::OverlayXfs(_) => panic!("not a fake driver"),
        }
    }

    /// Check the backing filesystem satisfies the backend's requirements.
    pub fn validate_filesystem(&self) -> Result<()> {
        match &self.backend {
            Backend::OverlayXfs(driver) => driver.validate_filesystem(),
            Backend::Fake(_) => Ok(()),
        }
    }

    /// Claim `volumes/<id>`: created empty with mode 0700, failing if the
    /// volume already exists.
    pub fn create_volume(&self, parent_id: Option<&str>, id: &str) -> Result<PathBuf> {
        tracing::debug!(parent = parent_id.unwrap_or(""), id, "creating volume");
        let path = self.store_path.join(VOLUMES_DIR).join(id);
        std::fs::create_dir(&path)?;
        overlayxfs::set_mode(&path, 0o700)?;
        Ok(path)
    }

    /// Remove a volume tree; absent volumes are fine.
    pub fn destroy_volume(&self, id: &str) -> Result<()> {
        tracing::debug!(id, "destroying volume");
        match std::fs::remove_dir_all(self.store_path.join(VOLUMES_DIR).join(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All volume ids present in the store.
    pub fn volumes(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.store_path.join(VOLUMES_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    /// Resolve a volume id to its path; the volume must exist.
    pub fn volume_path(&self, id: &str) -> Result<PathBuf> {
        let path = self.store_path.join(VOLUMES_DIR).join(id);
        if !path.is_dir() {
            return Err(StoreError::VolumeNotFound(id.to_string()));
        }
        Ok(path)
    }

    /// Compose an image from its base volumes.
    pub fn create_image(&self, spec: &ImageDriverSpec) -> Result<()> {
        if !spec.image_path.is_dir() {
            return Err(StoreError::ImageNotFound(
                spec.image_path.display().to_string(),
            ));
        }
        for base in &spec.base_volume_paths {
            if !base.is_dir() {
                return Err(StoreError::VolumeNotFound(base.display().to_string()));
            }
        }
        match &self.backend {
            Backend::OverlayXfs(driver) => driver.create_image(spec),
            Backend::Fake(driver) => driver.create_image(spec),
        }
    }

    /// Tear an image down: unmount and remove its mount point, work, and
    /// writable directories. The image directory itself stays; the caller
    /// owns it.
    pub fn destroy_image(&self, image_path: &Path) -> Result<()> {
        match &self.backend {
            Backend::OverlayXfs(driver) => driver.destroy_image(image_path),
            Backend::Fake(driver) => driver.destroy_image(image_path),
        }
    }

    /// Report disk usage for an image.
    pub fn stats(&self, image_path: &Path) -> Result<VolumeStats> {
        if !image_path.is_dir() {
            return Err(StoreError::ImageNotFound(
                image_path.display().to_string(),
            ));
        }
        match &self.backend {
            Backend::OverlayXfs(driver) => driver.stats(image_path),
            Backend::Fake(driver) => driver.stats(image_path),
        }
    }
}
