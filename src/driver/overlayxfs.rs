//! The overlay-over-XFS backend.
//!
//! Images are overlay mounts: the committed volumes are the lower layers,
//! `diff/` is the upper (writable) layer, `workdir/` is overlay's scratch
//! space, and `rootfs/` is the mount point handed to the runtime. Disk
//! limits are XFS project quotas applied to the image directory before
//! the mount, so every byte written through `rootfs/` lands in `diff/`
//! and is accounted.

use std::path::{Path, PathBuf};

use rustix::mount::{MountFlags, UnmountFlags, mount, unmount};

use super::quota::QuotaControl;
use super::{ImageDriverSpec, VolumeStats};
use crate::error::{Result, StoreError};
use crate::store::IMAGES_DIR;

/// Writable layer directory inside an image.
pub const UPPER_DIR: &str = "diff";
/// Overlay scratch directory inside an image.
pub const WORK_DIR: &str = "workdir";
/// The composed mount point inside an image.
pub const ROOTFS_DIR: &str = "rootfs";

/// Records the combined base-volume size at image creation, so `stats`
/// can report totals without walking the lowers.
pub(super) const IMAGE_INFO_FILE: &str = "image_info";

/// `statfs(2)` magic for XFS.
const XFS_SUPER_MAGIC: i64 = 0x5846_5342;

/// The reference driver backend.
#[derive(Debug)]
pub struct OverlayXfs {
    store_path: PathBuf,
}

impl OverlayXfs {
    /// Create a backend rooted at the store path.
    pub fn new<P: AsRef<Path>>(store_path: P) -> Self {
        Self {
            store_path: store_path.as_ref().to_path_buf(),
        }
    }

    /// Fail unless the store path lives on XFS.
    pub fn validate_filesystem(&self) -> Result<()> {
        let stat = rustix::fs::statfs(&self.store_path).map_err(std::io::Error::from)?;
        if stat.f_type as i64 != XFS_SUPER_MAGIC {
            return Err(StoreError::StoreInvalid(format!(
                "store {} is not on an XFS filesystem (f_type {:#x})",
                self.store_path.display(),
                stat.f_type,
            )));
        }
        Ok(())
    }

    pub(super) fn create_image(&self, spec: &ImageDriverSpec) -> Result<()> {
        let span = tracing::debug_span!("create-image", image = %spec.image_path.display());
        let _entered = span.enter();

        if spec.disk_limit > 0 {
            self.apply_disk_limit(spec)?;
        }
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
        if spec.owner_uid != 0 || spec.owner_gid != 0 {
            for path in [&spec.image_path, &upper, &work, &rootfs] {
                chown(path, spec.owner_uid, spec.owner_gid)?;
            }
        }

        let lowerdir = spec
            .base_volume_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!(
            "lowerdir={lowerdir},upperdir={},workdir={}",
            upper.display(),
            work.display()
        );

        tracing::debug!(rootfs = %rootfs.display(), options = %options, "mounting overlay");
        let options_c = std::ffi::CString::new(options).expect("mount options contain no NUL bytes");
        if let Err(e) = mount("overlay", &rootfs, "overlay", MountFlags::empty(), &*options_c) {
            // Leave nothing behind: a half-created image directory must
            // not look like a provisioned one.
            for dir in [&rootfs, &work, &upper] {
                let _ = std::fs::remove_dir_all(dir);
            }
            return Err(StoreError::MountFailed {
                target: rootfs,
                source: std::io::Error::from(e),
            });
        }
        Ok(())
    }

    pub(super) fn destroy_image(&self, image_path: &Path) -> Result<()> {
        let span = tracing::debug_span!("destroy-image", image = %image_path.display());
        let _entered = span.enter();

        let rootfs = image_path.join(ROOTFS_DIR);
        match unmount(&rootfs, UnmountFlags::empty()) {
            Ok(()) => {}
            // Not mounted (crash between mkdir and mount); the
            // directories still have to go.
            Err(rustix::io::Errno::INVAL) | Err(rustix::io::Errno::NOENT) => {}
            Err(e) => {
                return Err(StoreError::Io(std::io::Error::from(e)));
            }
        }
        for (dir, recursive) in [(rootfs, false), (image_path.join(WORK_DIR), true), (image_path.join(UPPER_DIR), true)] {
            let result = if recursive {
                std::fs::remove_dir_all(&dir)
            } else {
                std::fs::remove_dir(&dir)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub(super) fn stats(&self, image_path: &Path) -> Result<VolumeStats> {
        let control = QuotaControl::new(&self.store_path.join(IMAGES_DIR))?;
        let usage = control.usage(&image_path.join(UPPER_DIR))?;
        let base_size = read_image_info(image_path)?;
        Ok(VolumeStats {
            exclusive_bytes_used: usage.bytes_used,
            total_bytes_used: usage.bytes_used + base_size,
        })
    }

    /// Size the project quota before anything is mounted. By default the
    /// limit covers the base image too, so the writable layer gets what
    /// is left; with `exclude_image_from_quota` the whole limit goes to
    /// the writable layer.
    fn apply_disk_limit(&self, spec: &ImageDriverSpec) -> Result<()> {
        let effective = if spec.exclude_image_from_quota {
            spec.disk_limit
        } else {
            if spec.disk_limit <= spec.base_volume_size {
                return Err(StoreError::Quota {
                    path: spec.image_path.clone(),
                    reason: format!(
                        "disk limit {} is smaller than the base image ({} bytes)",
                        spec.disk_limit, spec.base_volume_size
                    ),
                });
            }
            spec.disk_limit - spec.base_volume_size
        };

        let images_path = self.store_path.join(IMAGES_DIR);
        let control = QuotaControl::new(&images_path)?;
        control.set_quota(&images_path, &spec.image_path, effective)
    }
}

/// Read the base-volume size recorded at creation time.
pub(super) fn read_image_info(image_path: &Path) -> Result<u64> {
    let raw = std::fs::read_to_string(image_path.join(IMAGE_INFO_FILE))?;
    raw.trim().parse().map_err(|_| {
        StoreError::StoreInvalid(format!(
            "corrupt {} in {}",
            IMAGE_INFO_FILE,
            image_path.display()
        ))
    })
}

pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

pub(super) fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    rustix::fs::chown(
        path,
        Some(rustix::fs::Uid::from_raw(uid)),
        Some(rustix::fs::Gid::from_raw(gid)),
    )
    .map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_INFO_FILE), "12345").unwrap();
        assert_eq!(read_image_info(dir.path()).unwrap(), 12345);
    }

    #[test]
    fn corrupt_image_info_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IMAGE_INFO_FILE), "not-a-number").unwrap();
        assert!(matches!(
            read_image_info(dir.path()),
            Err(StoreError::StoreInvalid(_))
        ));
    }

    #[test]
    fn non_xfs_store_fails_validation() {
        // tempdirs live on tmpfs or the build filesystem, not XFS.
        let dir = tempfile::tempdir().unwrap();
        let driver = OverlayXfs::new(dir.path());
        if let Err(e) = driver.validate_filesystem() {
            assert!(matches!(e, StoreError::StoreInvalid(_)));
        }
    }
}
