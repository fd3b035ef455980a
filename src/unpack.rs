//! Tar stream unpacking with whiteout and id-mapping semantics.
//!
//! The unpacker consumes a layer's tar byte stream into a target directory
//! handle. Entries are applied in stream order:
//!
//! - `.wh..wh..opq` marks its parent directory opaque: existing contents
//!   are removed (one level deep, subtrees recursively) and the marker is
//!   not materialized.
//! - `.wh.<name>` deletes the named sibling. If the sibling is not present
//!   in the tree being unpacked the deletion refers to a lower volume, and
//!   the whiteout is materialized in overlay's native form (a 0:0
//!   character device) so the union mount hides the lower entry.
//! - Hardlinks resolve against entries unpacked earlier in the same
//!   stream; symlinks, fifos, and device nodes are recreated; xattrs
//!   (including file capabilities) are applied where the filesystem
//!   supports them.
//! - Entry owners are translated through the configured id mapping; an id
//!   outside every range fails the unpack.
//!
//! Entry paths are validated before use: absolute paths and `..`
//! components are rejected, and all writes go through the target's
//! [`Dir`] handle, so a hostile archive cannot escape the scratch
//! directory.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use cap_std::fs::{Dir, OpenOptions, Permissions, PermissionsExt};
use rustix::fs::{AtFlags, FileType, Gid, Mode, Uid, XattrFlags};
use tar::EntryType;

use crate::error::{Result, StoreError};
use crate::idmap::IdMappings;

/// Whiteout filename prefix.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Opaque whiteout marker filename.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Overlayfs opaque-directory attribute.
const OPAQUE_XATTR: &str = "trusted.overlay.opaque";
/// Pax extension prefix carrying extended attributes.
const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

/// How the unpacker applies entry metadata.
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Translation table for entry owners.
    pub mappings: IdMappings,
    /// Whether to chown entries to their mapped owners. Requires
    /// CAP_CHOWN (root, or namespace root inside the unpack helper).
    pub preserve_ownership: bool,
}

/// What an unpack produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackStats {
    /// Total on-disk size of the produced tree in bytes.
    pub bytes_on_disk: u64,
    /// Number of tar entries applied.
    pub entries: u64,
}

/// Applies tar streams to directories.
#[derive(Debug, Default)]
pub struct Unpacker {
    options: UnpackOptions,
}

impl Unpacker {
    /// Create an unpacker with the given options.
    pub fn new(options: UnpackOptions) -> Self {
        Self { options }
    }

    /// Unpack `stream` into `target`. `digest` is used for error context
    /// only. On error the caller discards the partially written tree.
    pub fn unpack(
        &self,
        digest: &str,
        stream: impl Read,
        target: &Dir,
    ) -> Result<UnpackStats> {
        let span = tracing::debug_span!("unpack", digest = %digest);
        let _entered = span.enter();

        let mut archive = tar::Archive::new(stream);
        // Layer streams may be concatenated archives; keep reading past
        // the end-of-archive blocks.
        archive.set_ignore_zeros(true);

        let mut entries_applied = 0u64;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let header_type = entry.header().entry_type();
            if matches!(
                header_type,
                EntryType::XHeader | EntryType::XGlobalHeader | EntryType::GNULongName
            ) {
                continue;
            }

            let raw_path = entry.path()?.into_owned();
            let Some(path) = clean_entry_path(digest, &raw_path)? else {
                continue;
            };
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            if file_name == OPAQUE_WHITEOUT {
                self.apply_opaque(target, path.parent().unwrap_or(Path::new("")))?;
                entries_applied += 1;
                continue;
            }
            if let Some(victim) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();
                self.apply_whiteout(target, &parent, victim)?;
                entries_applied += 1;
                continue;
            }

            let uid = self.options.mappings.map_uid(entry.header().uid()? as u32)?;
            let gid = self.options.mappings.map_gid(entry.header().gid()? as u32)?;
            let mode = entry.header().mode()? & 0o7777;

            match header_type {
                EntryType::Directory => {
                    match target.symlink_metadata(&path) {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => {
                            target.remove_file(&path)?;
                            target.create_dir(&path)?;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            target.create_dir_all(&path)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.apply_metadata(target, &path, uid, gid, Some(mode))?;
                }
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    self.write_file(target, &path, &mut entry, uid, gid, mode)?;
                }
                EntryType::Symlink => {
                    let link = entry
                        .link_name()?
                        .ok_or_else(|| StoreError::LayerCorrupt {
                            digest: digest.to_string(),
                            reason: format!("symlink {} without target", path.display()),
                        })?
                        .into_owned();
                    ensure_parent(target, &path)?;
                    remove_existing(target, &path)?;
                    target.symlink(&link, &path)?;
                    self.apply_metadata(target, &path, uid, gid, None)?;
                }
                EntryType::Link => {
                    let link = entry
                        .link_name()?
                        .ok_or_else(|| StoreError::LayerCorrupt {
                            digest: digest.to_string(),
                            reason: format!("hardlink {} without target", path.display()),
                        })?
                        .into_owned();
                    let Some(link) = clean_entry_path(digest, &link)? else {
                        continue;
                    };
                    ensure_parent(target, &path)?;
                    remove_existing(target, &path)?;
                    target.hard_link(&link, target, &path)?;
                }
                EntryType::Fifo => {
                    ensure_parent(target, &path)?;
                    remove_existing(target, &path)?;
                    rustix::fs::mknodat(
                        target,
                        &path,
                        FileType::Fifo,
                        Mode::from_raw_mode(mode),
                        0,
                    )
                    .map_err(std::io::Error::from)?;
                    self.apply_metadata(target, &path, uid, gid, None)?;
                }
                EntryType::Char | EntryType::Block => {
                    let file_type = if header_type == EntryType::Char {
                        FileType::CharacterDevice
                    } else {
                        FileType::BlockDevice
                    };
                    let major = entry.header().device_major()?.unwrap_or(0);
                    let minor = entry.header().device_minor()?.unwrap_or(0);
                    ensure_parent(target, &path)?;
                    remove_existing(target, &path)?;
                    rustix::fs::mknodat(
                        target,
                        &path,
                        file_type,
                        Mode::from_raw_mode(mode),
                        rustix::fs::makedev(major, minor),
                    )
                    .map_err(std::io::Error::from)?;
                    self.apply_metadata(target, &path, uid, gid, None)?;
                }
                other => {
                    tracing::debug!(path = %path.display(), ?other, "skipping entry type");
                    continue;
                }
            }
            entries_applied += 1;
        }

        Ok(UnpackStats {
            bytes_on_disk: tree_size(target)?,
            entries: entries_applied,
        })
    }

    fn write_file(
        &self,
        target: &Dir,
        path: &Path,
        entry: &mut tar::Entry<'_, impl Read>,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<()> {
        // Extended attributes ride in pax records ahead of the content.
        let mut xattrs = Vec::new();
        if let Ok(Some(extensions)) = entry.pax_extensions() {
            for extension in extensions {
                let extension = extension?;
                if let Ok(key) = extension.key() {
                    if let Some(name) = key.strip_prefix(PAX_XATTR_PREFIX) {
                        xattrs.push((name.to_string(), extension.value_bytes().to_vec()));
                    }
                }
            }
        }

        ensure_parent(target, path)?;
        remove_existing(target, path)?;

        let mut file = target.open_with(
            path,
            OpenOptions::new().create(true).write(true).truncate(true),
        )?;
        std::io::copy(entry, &mut file)?;

        for (name, value) in &xattrs {
            if let Err(e) =
                rustix::fs::fsetxattr(&file, name.as_str(), value, XattrFlags::empty())
            {
                match e {
                    rustix::io::Errno::NOTSUP | rustix::io::Errno::PERM => {
                        tracing::debug!(path = %path.display(), xattr = %name, "xattr not applied");
                    }
                    e => return Err(std::io::Error::from(e).into()),
                }
            }
        }
        drop(file);

        self.apply_metadata(target, path, uid, gid, Some(mode))?;
        Ok(())
    }

    /// Chown (when preserving ownership) and chmod an unpacked entry.
    /// Ownership first: chown strips setuid/setgid bits.
    fn apply_metadata(
        &self,
        target: &Dir,
        path: &Path,
        uid: u32,
        gid: u32,
        mode: Option<u32>,
    ) -> Result<()> {
        if self.options.preserve_ownership {
            rustix::fs::chownat(
                target,
                path,
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
                AtFlags::SYMLINK_NOFOLLOW,
            )
            .map_err(std::io::Error::from)?;
        }
        if let Some(mode) = mode {
            target.set_permissions(path, Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    /// Remove a directory's existing contents and mark it opaque for the
    /// union mount. Missing xattr support only costs cross-volume opacity;
    /// the in-tree deletion has already happened.
    fn apply_opaque(&self, target: &Dir, parent: &Path) -> Result<()> {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        if !target.try_exists(parent)? {
            target.create_dir_all(parent)?;
        }
        let dir = target.open_dir(parent)?;
        for child in dir.entries()? {
            let child = child?;
            if child.file_type()?.is_dir() {
                dir.remove_dir_all(child.file_name())?;
            } else {
                dir.remove_file(child.file_name())?;
            }
        }
        if let Err(e) = rustix::fs::fsetxattr(&dir, OPAQUE_XATTR, b"y", XattrFlags::empty()) {
            match e {
                rustix::io::Errno::NOTSUP | rustix::io::Errno::PERM => {
                    tracing::debug!(parent = %parent.display(), "opaque xattr not applied");
                }
                e => return Err(std::io::Error::from(e).into()),
            }
        }
        Ok(())
    }

    /// Delete the whited-out sibling, or materialize the overlay whiteout
    /// device when the sibling belongs to a lower volume.
    fn apply_whiteout(&self, target: &Dir, parent: &Path, victim: &str) -> Result<()> {
        let victim_path = parent.join(victim);
        match target.symlink_metadata(&victim_path) {
            Ok(meta) => {
                if meta.is_dir() {
                    target.remove_dir_all(&victim_path)?;
                } else {
                    target.remove_file(&victim_path)?;
                }
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !parent.as_os_str().is_empty() && !target.try_exists(parent)? {
            target.create_dir_all(parent)?;
        }
        rustix::fs::mknodat(
            target,
            &victim_path,
            FileType::CharacterDevice,
            Mode::empty(),
            rustix::fs::makedev(0, 0),
        )
        .map_err(std::io::Error::from)?;
        Ok(())
    }
}

/// Normalize a tar entry path. Returns `None` for the archive root entry;
/// rejects absolute paths and `..` components.
fn clean_entry_path(digest: &str, raw: &Path) -> Result<Option<PathBuf>> {
    let mut cleaned = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => {
                return Err(StoreError::LayerCorrupt {
                    digest: digest.to_string(),
                    reason: format!("entry path escapes the layer root: {}", raw.display()),
                });
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(cleaned))
}

fn ensure_parent(target: &Dir, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !target.try_exists(parent)? {
            target.create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn remove_existing(target: &Dir, path: &Path) -> Result<()> {
    match target.symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => target.remove_dir_all(path)?,
        Ok(_) => target.remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Total size in bytes of the regular files in a tree.
pub(crate) fn tree_size(dir: &Dir) -> Result<u64> {
    let mut total = 0u64;
    for entry in dir.entries()? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += tree_size(&entry.open_dir()?)?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMap;
    use cap_std::ambient_authority;
    use std::io::Cursor;

    fn open_target(dir: &tempfile::TempDir) -> Dir {
        Dir::open_ambient_dir(dir.path(), ambient_authority()).unwrap()
    }

    fn header(entry_type: EntryType, size: u64, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32, data: &[u8]) {
        let mut h = header(EntryType::Regular, data.len() as u64, mode);
        builder.append_data(&mut h, path, data).unwrap();
    }

    fn append_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str, mode: u32) {
        let mut h = header(EntryType::Directory, 0, mode);
        builder.append_data(&mut h, path, &[][..]).unwrap();
    }

    fn unpack_bytes(bytes: &[u8], target: &Dir) -> Result<UnpackStats> {
        Unpacker::default().unpack("sha256:test", Cursor::new(bytes), target)
    }

    #[test]
    fn unpacks_files_and_modes() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "a", 0o644, b"hello\n");
        append_dir(&mut builder, "b", 0o755);
        append_file(&mut builder, "b/c", 0o755, b"");
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        let stats = unpack_bytes(&bytes, &target).unwrap();

        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"hello\n");
        let mode = std::fs::metadata(dir.path().join("b/c")).unwrap();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(mode.permissions().mode() & 0o7777, 0o755);
        assert_eq!(stats.bytes_on_disk, 6);
        assert_eq!(stats.entries, 3);
    }

    #[test]
    fn whiteout_removes_sibling_from_earlier_layer() {
        // Layer 0 provides /etc/hosts; layer 1 whites it out. The two
        // archives are concatenated into one stream.
        let mut lower = tar::Builder::new(Vec::new());
        append_dir(&mut lower, "etc", 0o755);
        append_file(&mut lower, "etc/hosts", 0o644, b"1.1.1.1\n");
        let mut bytes = lower.into_inner().unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        append_file(&mut upper, "etc/.wh.hosts", 0o644, b"");
        bytes.extend_from_slice(&upper.into_inner().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        assert!(dir.path().join("etc").is_dir());
        assert!(!dir.path().join("etc/hosts").exists());
        assert!(!dir.path().join("etc/.wh.hosts").exists());
    }

    #[test]
    fn whiteout_removes_directories_too() {
        let mut lower = tar::Builder::new(Vec::new());
        append_dir(&mut lower, "opt/tool", 0o755);
        append_file(&mut lower, "opt/tool/bin", 0o755, b"x");
        let mut bytes = lower.into_inner().unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        append_file(&mut upper, "opt/.wh.tool", 0o644, b"");
        bytes.extend_from_slice(&upper.into_inner().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        assert!(dir.path().join("opt").is_dir());
        assert!(!dir.path().join("opt/tool").exists());
    }

    #[test]
    fn opaque_whiteout_clears_directory() {
        let mut lower = tar::Builder::new(Vec::new());
        append_dir(&mut lower, "var/log", 0o755);
        append_file(&mut lower, "var/log/a", 0o644, b"a");
        append_file(&mut lower, "var/log/b", 0o644, b"b");
        let mut bytes = lower.into_inner().unwrap();

        let mut upper = tar::Builder::new(Vec::new());
        append_file(&mut upper, "var/log/.wh..wh..opq", 0o644, b"");
        append_file(&mut upper, "var/log/c", 0o644, b"c");
        bytes.extend_from_slice(&upper.into_inner().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("var/log"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn hardlinks_resolve_within_the_stream() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "original", 0o644, b"shared");
        let mut h = header(EntryType::Link, 0, 0o644);
        h.set_link_name("original").unwrap();
        builder.append_data(&mut h, "alias", &[][..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        use std::os::unix::fs::MetadataExt;
        let original = std::fs::metadata(dir.path().join("original")).unwrap();
        let alias = std::fs::metadata(dir.path().join("alias")).unwrap();
        assert_eq!(original.ino(), alias.ino());
        assert_eq!(std::fs::read(dir.path().join("alias")).unwrap(), b"shared");
    }

    #[test]
    fn symlinks_are_recreated() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "data", 0o644, b"x");
        let mut h = header(EntryType::Symlink, 0, 0o777);
        h.set_link_name("data").unwrap();
        builder.append_data(&mut h, "pointer", &[][..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        let link = std::fs::read_link(dir.path().join("pointer")).unwrap();
        assert_eq!(link, PathBuf::from("data"));
    }

    #[test]
    fn later_entries_overwrite_earlier_ones() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "config", 0o644, b"old");
        append_file(&mut builder, "config", 0o600, b"new");
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        assert_eq!(std::fs::read(dir.path().join("config")).unwrap(), b"new");
    }

    #[test]
    fn path_traversal_is_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "ok", 0o644, b"fine");
        // The tar builder refuses `..` in set_path, so a hostile archive
        // has to be forged through the raw name field.
        let mut h = header(EntryType::Regular, 4, 0o644);
        let name = b"sub/../../evil";
        h.as_ustar_mut().unwrap().name[..name.len()].copy_from_slice(name);
        h.set_cksum();
        builder.append(&h, &b"evil"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        let err = unpack_bytes(&bytes, &target).unwrap_err();
        assert!(matches!(err, StoreError::LayerCorrupt { .. }));
    }

    #[test]
    fn unmappable_owner_fails_the_unpack() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(EntryType::Regular, 1, 0o644);
        h.set_uid(5000);
        builder.append_data(&mut h, "orphan", &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let options = UnpackOptions {
            mappings: IdMappings::new(vec![IdMap::new(0, 100000, 1000)], vec![]),
            preserve_ownership: false,
        };
        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        let err = Unpacker::new(options)
            .unpack("sha256:test", Cursor::new(bytes), &target)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnmappableId { kind: "uid", id: 5000 }
        ));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "a", 0o644, b"data");
        let mut bytes = builder.into_inner().unwrap();
        bytes.truncate(600);

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        assert!(unpack_bytes(&bytes, &target).is_err());
    }

    #[test]
    fn reports_tree_size() {
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "one", 0o644, &[0u8; 100]);
        append_dir(&mut builder, "nested", 0o755);
        append_file(&mut builder, "nested/two", 0o644, &[0u8; 50]);
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        let stats = unpack_bytes(&bytes, &target).unwrap();
        assert_eq!(stats.bytes_on_disk, 150);
    }

    #[test]
    #[ignore = "requires CAP_MKNOD (root or a user namespace)"]
    fn whiteout_without_sibling_becomes_overlay_device() {
        let mut builder = tar::Builder::new(Vec::new());
        append_dir(&mut builder, "etc", 0o755);
        append_file(&mut builder, "etc/.wh.hosts", 0o644, b"");
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = open_target(&dir);
        unpack_bytes(&bytes, &target).unwrap();

        use std::os::unix::fs::FileTypeExt;
        let meta = std::fs::symlink_metadata(dir.path().join("etc/hosts")).unwrap();
        assert!(meta.file_type().is_char_device());
    }
}
