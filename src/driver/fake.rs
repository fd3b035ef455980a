//! Hand-written fake backend for the test suites.
//!
//! Composes images without mount(2) or quotas: the base volumes are
//! copied into `rootfs/` bottom-up, and `stats` sizes the writable layer
//! by walking it. Everything else (directory layout, the `image_info`
//! record, destroy ordering) matches the real backend, so the cloner and
//! the garbage collector exercise the same paths they do in production.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use super::overlayxfs::{
    IMAGE_INFO_FILE, ROOTFS_DIR, UPPER_DIR, WORK_DIR, read_image_info, set_mode,
};
use super::{ImageDriverSpec, VolumeStats};
use crate::error::Result;
use crate::unpack::tree_size;

/// Test backend; records the images it creates and destroys.
#[derive(Debug, Default)]
pub struct FakeDriver {
    created: Mutex<Vec<PathBuf>>,
    destroyed: Mutex<Vec<PathBuf>>,
}

impl FakeDriver {
    /// Create an idle fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Image paths passed to `create_image`, in call order.
    pub fn created_images(&self) -> Vec<PathBuf> {
        self.created.lock().expect("fake state poisoned").clone()
    }

    /// Image paths passed to `destroy_image`, in call order.
    pub fn destroyed_images(&self) -> Vec<PathBuf> {
        self.destroyed.lock().expect("fake state poisoned").clone()
    }

    pub(super) fn create_image(&self, spec: &ImageDriverSpec) -> Result<()> {
        std::fs::write(
            spec.image_path.join(IMAGE_INFO_FILE),
            spec.base_volume_size.to_string(),
        )?;

        let upper = spec.image_path.join(UPPER_DIR);
        let work = spec.image_path.join(WORK_DIR);
        let rootfs = spec.image_path.join(ROOTFS_DIR);
        for dir in [&upper, &work, &rootfs] {
            std::fs::create_dir(dir)?;
            set_mode(dir, 0o700)?;
        }

        // Materialized union: lowers are given topmost-first, so copy in
        // reverse for the same precedence the overlay mount would give.
        for volume in spec.base_volume_paths.iter().rev() {
            copy_tree(volume, &rootfs)?;
        }

        self.created
            .lock()
            .expect("fake state poisoned")
            .push(spec.image_path.clone());
        Ok(())
    }

    pub(super) fn destroy_image(&self, image_path: &Path) -> Result<()> {
        for dir in [ROOTFS_DIR, WORK_DIR, UPPER_DIR] {
            match std::fs::remove_dir_all(image_path.join(dir)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.destroyed
            .lock()
            .expect("fake state poisoned")
            .push(image_path.to_path_buf());
        Ok(())
    }

    pub(super) fn stats(&self, image_path: &Path) -> Result<VolumeStats> {
        let upper = Dir::open_ambient_dir(image_path.join(UPPER_DIR), ambient_authority())?;
        let exclusive = tree_size(&upper)?;
        let base_size = read_image_info(image_path)?;
        Ok(VolumeStats {
            exclusive_bytes_used: exclusive,
            total_bytes_used: exclusive + base_size,
        })
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if !dest.is_dir() {
                std::fs::create_dir(&dest)?;
                std::fs::set_permissions(&dest, entry.metadata()?.permissions())?;
            }
            copy_tree(&source, &dest)?;
        } else if file_type.is_symlink() {
            let _ = std::fs::remove_file(&dest);
            std::os::unix::fs::symlink(std::fs::read_link(&source)?, &dest)?;
        } else {
            let _ = std::fs::remove_file(&dest);
            std::fs::copy(&source, &dest)?;
        }
    }
    Ok(())
}
