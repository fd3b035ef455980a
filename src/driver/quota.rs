//! XFS project quota control.
//!
//! Disk limits are enforced with XFS project quotas: every image directory
//! is assigned its own project id (with `FS_XFLAG_PROJINHERIT`, so new
//! files inherit it) and a block hard limit is set through `quotactl(2)`.
//! Usage reporting reads the same project's block count back.
//!
//! `quotactl` and the `FS_IOC_FSSETXATTR` ioctl have no safe wrapper in
//! the ecosystem; this module is the only place in the crate that uses
//! `unsafe`, and every call site passes a struct the kernel defines.

use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// First project id we allocate. Keeps clear of the low ranges other
/// tooling hands out.
const FIRST_PROJECT_ID: u32 = 1 << 20;

/// `FS_IOC_FSGETXATTR` / `FS_IOC_FSSETXATTR` ioctl numbers.
const FS_IOC_FSGETXATTR: libc::c_ulong = 0x801c581f;
const FS_IOC_FSSETXATTR: libc::c_ulong = 0x401c5820;

/// Files created below the directory inherit its project id.
const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

/// XFS quotactl subcommands, shifted per `QCMD`.
const Q_XGETQUOTA: libc::c_int = ('X' as libc::c_int) << 8 | 3;
const Q_XSETQLIM: libc::c_int = ('X' as libc::c_int) << 8 | 4;
/// Project quota type for `QCMD`.
const PRJQUOTA: libc::c_int = 2;

/// `fs_disk_quota` versioning and flags.
const FS_DQUOT_VERSION: i8 = 1;
const FS_PROJ_QUOTA: i8 = 2;
const FS_DQ_BSOFT: u16 = 1 << 2;
const FS_DQ_BHARD: u16 = 1 << 3;

/// Quota block size: XFS quota limits and counts are in 512-byte units.
const BASIC_BLOCK: u64 = 512;

const fn qcmd(cmd: libc::c_int, quota_type: libc::c_int) -> libc::c_int {
    (cmd << 8) | (quota_type & 0xff)
}

/// `struct fsxattr` from `linux/fs.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FsXattr {
    fsx_xflags: u32,
    fsx_extsize: u32,
    fsx_nextents: u32,
    fsx_projid: u32,
    fsx_cowextsize: u32,
    fsx_pad: [u8; 8],
}

/// `struct fs_disk_quota` from `linux/dqblk_xfs.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct FsDiskQuota {
    d_version: i8,
    d_flags: i8,
    d_fieldmask: u16,
    d_id: u32,
    d_blk_hardlimit: u64,
    d_blk_softlimit: u64,
    d_ino_hardlimit: u64,
    d_ino_softlimit: u64,
    d_bcount: u64,
    d_icount: u64,
    d_itimer: i32,
    d_btimer: i32,
    d_iwarns: u16,
    d_bwarns: u16,
    d_padding2: i32,
    d_rtb_hardlimit: u64,
    d_rtb_softlimit: u64,
    d_rtbcount: u64,
    d_rtbtimer: i32,
    d_rtbwarns: u16,
    d_padding3: i16,
    d_fillchar: [i8; 8],
    d_padding4: u32,
}

/// Reported usage for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Bytes currently accounted to the project.
    pub bytes_used: u64,
    /// Configured hard limit in bytes (0 when unlimited).
    pub bytes_limit: u64,
}

/// Controls project quotas for image directories under one filesystem.
#[derive(Debug)]
pub struct QuotaControl {
    backing_device: CString,
}

impl QuotaControl {
    /// Create a control for the filesystem hosting `images_path`.
    pub fn new(images_path: &Path) -> Result<Self> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        let canonical = images_path.canonicalize()?;
        let device = backing_device(&mountinfo, &canonical).ok_or_else(|| {
            StoreError::Quota {
                path: images_path.to_path_buf(),
                reason: "no mount found in /proc/self/mountinfo".into(),
            }
        })?;
        let backing_device = CString::new(
            std::os::unix::ffi::OsStringExt::into_vec(device.into_os_string()),
        )
        .map_err(|_| StoreError::Quota {
            path: images_path.to_path_buf(),
            reason: "backing device path contains a NUL byte".into(),
        })?;
        Ok(Self { backing_device })
    }

    /// Assign a fresh project id to `dir` and cap it at `size_bytes`.
    ///
    /// The project id is one past the highest id found on the sibling
    /// image directories, so ids stay unique per store.
    pub fn set_quota(&self, images_path: &Path, dir: &Path, size_bytes: u64) -> Result<()> {
        let project_id = self.next_project_id(images_path)?;
        set_project_id(dir, project_id)?;

        let mut quota = FsDiskQuota {
            d_version: FS_DQUOT_VERSION,
            d_flags: FS_PROJ_QUOTA,
            d_fieldmask: FS_DQ_BHARD | FS_DQ_BSOFT,
            d_id: project_id,
            d_blk_hardlimit: size_bytes / BASIC_BLOCK,
            d_blk_softlimit: size_bytes / BASIC_BLOCK,
            ..Default::default()
        };

        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_XSETQLIM, PRJQUOTA),
                self.backing_device.as_ptr(),
                project_id as libc::c_int,
                (&raw mut quota).cast::<libc::c_char>(),
            )
        };
        if rc != 0 {
            return Err(StoreError::Quota {
                path: dir.to_path_buf(),
                reason: format!(
                    "setting limit to {size_bytes} bytes: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }
        tracing::debug!(dir = %dir.display(), project_id, size_bytes, "quota applied");
        Ok(())
    }

    /// Report usage for the project assigned to `dir`.
    pub fn usage(&self, dir: &Path) -> Result<QuotaUsage> {
        let project_id = get_project_id(dir)?;
        let mut quota = FsDiskQuota::default();

        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_XGETQUOTA, PRJQUOTA),
                self.backing_device.as_ptr(),
                project_id as libc::c_int,
                (&raw mut quota).cast::<libc::c_char>(),
            )
        };
        if rc != 0 {
            return Err(StoreError::Quota {
                path: dir.to_path_buf(),
                reason: format!("reading usage: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(QuotaUsage {
            bytes_used: quota.d_bcount * BASIC_BLOCK,
            bytes_limit: quota.d_blk_hardlimit * BASIC_BLOCK,
        })
    }

    fn next_project_id(&self, images_path: &Path) -> Result<u32> {
        let mut highest = FIRST_PROJECT_ID - 1;
        for entry in std::fs::read_dir(images_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = get_project_id(&entry.path()) {
                highest = highest.max(id);
            }
        }
        Ok(highest + 1)
    }
}

fn get_project_id(dir: &Path) -> Result<u32> {
    let attrs = fsxattr_ioctl(dir, None)?;
    Ok(attrs.fsx_projid)
}

fn set_project_id(dir: &Path, project_id: u32) -> Result<()> {
    let mut attrs = fsxattr_ioctl(dir, None)?;
    attrs.fsx_projid = project_id;
    attrs.fsx_xflags |= FS_XFLAG_PROJINHERIT;
    fsxattr_ioctl(dir, Some(attrs))?;
    Ok(())
}

/// Get (`update` = None) or set the fsxattr block of a directory.
fn fsxattr_ioctl(dir: &Path, update: Option<FsXattr>) -> Result<FsXattr> {
    let file = File::open(dir)?;
    let mut attrs = update.unwrap_or_default();
    let request = if update.is_some() {
        FS_IOC_FSSETXATTR
    } else {
        FS_IOC_FSGETXATTR
    };

    #[allow(unsafe_code)]
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), request, &raw mut attrs) };
    if rc != 0 {
        return Err(StoreError::Quota {
            path: dir.to_path_buf(),
            reason: format!(
                "fsxattr ioctl: {}",
                std::io::Error::last_os_error()
            ),
        });
    }
    Ok(attrs)
}

/// Find the mount source backing `path`: the source field of the
/// mountinfo entry with the longest mount-point prefix of `path`.
fn backing_device(mountinfo: &str, path: &Path) -> Option<PathBuf> {
    let mut best: Option<(usize, PathBuf)> = None;
    for line in mountinfo.lines() {
        // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
        let Some((head, tail)) = line.split_once(" - ") else {
            continue;
        };
        let mount_point = match head.split(' ').nth(4) {
            Some(p) => PathBuf::from(p),
            None => continue,
        };
        let source = match tail.split(' ').nth(1) {
            Some(s) => PathBuf::from(s),
            None => continue,
        };
        if path.starts_with(&mount_point) {
            let depth = mount_point.components().count();
            if best.as_ref().is_none_or(|(d, _)| depth >= *d) {
                best = Some((depth, source));
            }
        }
    }
    best.map(|(_, source)| source)
}
