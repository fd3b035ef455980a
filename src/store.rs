//! The persistent store: layout, metadata, and validation.
//!
//! All state lives under a caller-chosen store path:
//!
//! ```text
//! store-path/
//! ├── volumes/<volume-id>/              # committed unpacked layers
//! ├── meta/
//! │   ├── store.json                    # mapping + size recorded at init
//! │   ├── volume-<volume-id>            # sidecar: {"size": .., "digest": ..}
//! │   └── dependencies/
//! │       └── image-<image-id>.json     # ordered volume chain of an image
//! ├── images/<image-id>/                # rootfs/ diff/ workdir/ image.json image_quota
//! ├── locks/<name>                      # advisory lockfiles
//! └── tmp/                              # scratch during unpack
//! ```
//!
//! The invariant the sidecars encode: a volume directory exists iff its
//! sidecar records a successful unpack. Partial unpacks only ever live
//! under `tmp/` and are renamed into `volumes/` after the sidecar's data
//! is known.
//!
//! File access below the store root goes through a [`cap_std::fs::Dir`]
//! handle, so operations cannot escape the store tree. Absolute paths are
//! handed out only where the kernel interface wants them (mount, quota).

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, Permissions, PermissionsExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::idmap::IdMappings;
use crate::locksmith::Locksmith;

/// Directory for committed volumes.
pub const VOLUMES_DIR: &str = "volumes";
/// Directory for materialized images.
pub const IMAGES_DIR: &str = "images";
/// Directory for store metadata.
pub const META_DIR: &str = "meta";
/// Directory for per-image volume dependency records, under `meta/`.
pub const DEPENDENCIES_DIR: &str = "dependencies";
/// Directory for advisory lockfiles.
pub const LOCKS_DIR: &str = "locks";
/// Scratch directory for in-progress unpacks.
pub const TMP_DIR: &str = "tmp";

/// Name of the store-level metadata file under `meta/`.
const STORE_META_FILE: &str = "store.json";
/// Sidecar filename prefix under `meta/`.
const VOLUME_META_PREFIX: &str = "volume-";

/// Sidecar recording a committed volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// On-disk size of the unpacked tree in bytes.
    pub size: u64,
    /// Digest of the layer the volume was unpacked from.
    pub digest: String,
}

/// Store-level metadata written by `init-store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMeta {
    /// The id mappings the store was initialized with.
    pub mappings: IdMappings,
    /// Requested store size in bytes, if the caller supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_size_bytes: Option<u64>,
}

/// Handle to an initialized store.
#[derive(Debug)]
pub struct Store {
    root_dir: Dir,
    root_path: PathBuf,
    locksmith: Locksmith,
}

impl Store {
    /// Open the store at `path`, creating the directory skeleton if it is
    /// missing. Does not write `meta/store.json`; that is `init`'s job.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root_path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_path)?;

        let root_dir = Dir::open_ambient_dir(&root_path, ambient_authority())?;
        Self::ensure_skeleton(&root_dir)?;

        let locksmith = Locksmith::new(root_dir.open_dir(LOCKS_DIR)?);

        Ok(Self {
            root_dir,
            root_path,
            locksmith,
        })
    }

    /// Initialize the store: create the skeleton, verify the root's
    /// ownership matches the mapping's host root, and persist the store
    /// metadata for later consistency checks.
    pub fn init<P: AsRef<Path>>(
        path: P,
        mappings: &IdMappings,
        store_size_bytes: Option<u64>,
    ) -> Result<Self> {
        let store = Self::open(path)?;
        store.validate_ownership(mappings)?;
        store.write_store_meta(&StoreMeta {
            mappings: mappings.clone(),
            store_size_bytes,
        })?;
        tracing::info!(store = %store.root_path.display(), "store initialized");
        Ok(store)
    }

    fn ensure_skeleton(root_dir: &Dir) -> Result<()> {
        for name in [VOLUMES_DIR, IMAGES_DIR, META_DIR, LOCKS_DIR, TMP_DIR] {
            Self::ensure_dir(root_dir, name)?;
        }
        Self::ensure_dir(&root_dir.open_dir(META_DIR)?, DEPENDENCIES_DIR)?;
        Ok(())
    }

    /// Create a skeleton directory; losing the race to a concurrent
    /// invocation is fine.
    fn ensure_dir(parent: &Dir, name: &str) -> Result<()> {
        match parent.create_dir(name) {
            Ok(()) => {
                parent.set_permissions(name, Permissions::from_mode(0o700))?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check that the store root is owned by the host ids namespace root
    /// maps to. A store initialized for one mapping must not be driven by
    /// an invocation configured for another user.
    pub fn validate_ownership(&self, mappings: &IdMappings) -> Result<()> {
        let (want_uid, want_gid) = mappings.host_root();
        let meta = std::fs::metadata(&self.root_path)?;
        if meta.uid() != want_uid || meta.gid() != want_gid {
            return Err(StoreError::StoreInvalid(format!(
                "store {} is owned by {}:{}, expected {}:{}",
                self.root_path.display(),
                meta.uid(),
                meta.gid(),
                want_uid,
                want_gid
            )));
        }
        Ok(())
    }

    /// Verify the active mapping matches the one the store was initialized
    /// with. A store that was never `init`ed carries no record and passes.
    pub fn validate_mapping(&self, mappings: &IdMappings) -> Result<()> {
        let Some(recorded) = self.read_store_meta()? else {
            return Ok(());
        };
        if recorded.mappings.fingerprint() != mappings.fingerprint() {
            return Err(StoreError::StoreInvalid(
                "store was initialized with different id mappings".into(),
            ));
        }
        Ok(())
    }

    /// Absolute path of the store root.
    pub fn path(&self) -> &Path {
        &self.root_path
    }

    /// The store's lock service.
    pub fn locksmith(&self) -> &Locksmith {
        &self.locksmith
    }

    /// Capability handle to the store root.
    pub fn root_dir(&self) -> &Dir {
        &self.root_dir
    }

    /// Absolute path of a volume directory (whether or not it exists).
    pub fn volume_path(&self, volume_id: &str) -> PathBuf {
        self.root_path.join(VOLUMES_DIR).join(volume_id)
    }

    /// Absolute path of an image directory (whether or not it exists).
    pub fn image_path(&self, image_id: &str) -> PathBuf {
        self.root_path.join(IMAGES_DIR).join(image_id)
    }

    /// Create a fresh scratch directory under `tmp/` for an unpack.
    pub fn create_scratch(&self) -> Result<tempfile::TempDir> {
        let scratch = tempfile::Builder::new()
            .prefix("unpack-")
            .tempdir_in(self.root_path.join(TMP_DIR))?;
        Ok(scratch)
    }

    /// True when the volume directory exists and its sidecar parses.
    pub fn volume_committed(&self, volume_id: &str) -> Result<bool> {
        let volumes = self.root_dir.open_dir(VOLUMES_DIR)?;
        if !volumes.try_exists(volume_id)? {
            return Ok(false);
        }
        Ok(self.read_volume_meta(volume_id)?.is_some())
    }

    /// Read a volume's sidecar, if present and valid.
    pub fn read_volume_meta(&self, volume_id: &str) -> Result<Option<VolumeMeta>> {
        let meta = self.root_dir.open_dir(META_DIR)?;
        let name = format!("{VOLUME_META_PREFIX}{volume_id}");
        match meta.read_to_string(&name) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(parsed) => Ok(Some(parsed)),
                // Unparseable sidecar means the volume never committed
                // cleanly; callers treat it as absent and re-unpack.
                Err(_) => Ok(None),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a volume's sidecar atomically.
    pub fn write_volume_meta(&self, volume_id: &str, meta: &VolumeMeta) -> Result<()> {
        let name = format!("{VOLUME_META_PREFIX}{volume_id}");
        self.write_json_atomic(&name, meta)
    }

    /// Remove a volume's sidecar; absent is fine.
    pub fn remove_volume_meta(&self, volume_id: &str) -> Result<()> {
        let meta = self.root_dir.open_dir(META_DIR)?;
        let name = format!("{VOLUME_META_PREFIX}{volume_id}");
        match meta.remove_file(&name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sum of all committed volume sizes, from the sidecars.
    pub fn committed_volume_bytes(&self) -> Result<u64> {
        let meta = self.root_dir.open_dir(META_DIR)?;
        let mut total = 0u64;
        for entry in meta.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(volume_id) = name.strip_prefix(VOLUME_META_PREFIX) else {
                continue;
            };
            if let Some(sidecar) = self.read_volume_meta(volume_id)? {
                total += sidecar.size;
            }
        }
        Ok(total)
    }

    /// Record the ordered volume chain an image depends on.
    pub fn write_image_dependencies(&self, image_id: &str, chain: &[String]) -> Result<()> {
        let name = format!("{DEPENDENCIES_DIR}/image-{image_id}.json");
        self.write_json_atomic(&name, &chain)
    }

    /// Read an image's recorded volume chain.
    pub fn read_image_dependencies(&self, image_id: &str) -> Result<Option<Vec<String>>> {
        let deps = self.root_dir.open_dir(META_DIR)?.open_dir(DEPENDENCIES_DIR)?;
        let name = format!("image-{image_id}.json");
        match deps.read_to_string(&name) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop an image's dependency record; absent is fine.
    pub fn remove_image_dependencies(&self, image_id: &str) -> Result<()> {
        let deps = self.root_dir.open_dir(META_DIR)?.open_dir(DEPENDENCIES_DIR)?;
        let name = format!("image-{image_id}.json");
        match deps.remove_file(&name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every volume id referenced by any image's dependency record.
    pub fn referenced_volume_ids(&self) -> Result<HashSet<String>> {
        let deps = self.root_dir.open_dir(META_DIR)?.open_dir(DEPENDENCIES_DIR)?;
        let mut referenced = HashSet::new();
        for entry in deps.entries()? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("image-") {
                continue;
            }
            let content = deps.read_to_string(name)?;
            let chain: Vec<String> = serde_json::from_str(&content)?;
            referenced.extend(chain);
        }
        Ok(referenced)
    }

    fn read_store_meta(&self) -> Result<Option<StoreMeta>> {
        let meta = self.root_dir.open_dir(META_DIR)?;
        match meta.read_to_string(STORE_META_FILE) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_store_meta(&self, store_meta: &StoreMeta) -> Result<()> {
        self.write_json_atomic(STORE_META_FILE, store_meta)
    }

    /// Write JSON under `meta/` via a temp file and rename.
    fn write_json_atomic<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let meta = self.root_dir.open_dir(META_DIR)?;
        let json = serde_json::to_string_pretty(value)?;
        let temp_name = format!("{name}.{}.tmp", std::process::id());
        meta.write(&temp_name, json.as_bytes())?;
        meta.rename(&temp_name, &meta, name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMap;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_skeleton() {
        let (dir, _store) = temp_store();
        for name in ["volumes", "images", "meta", "meta/dependencies", "locks", "tmp"] {
            assert!(dir.path().join(name).is_dir(), "missing {name}");
        }
    }

    #[test]
    fn volume_meta_round_trip() {
        let (_dir, store) = temp_store();
        let meta = VolumeMeta {
            size: 4096,
            digest: "sha256:abcd".into(),
        };

        assert!(store.read_volume_meta("v1").unwrap().is_none());
        store.write_volume_meta("v1", &meta).unwrap();
        assert_eq!(store.read_volume_meta("v1").unwrap().unwrap(), meta);

        store.remove_volume_meta("v1").unwrap();
        assert!(store.read_volume_meta("v1").unwrap().is_none());
        // Removing again is not an error.
        store.remove_volume_meta("v1").unwrap();
    }

    #[test]
    fn volume_committed_requires_dir_and_sidecar() {
        let (dir, store) = temp_store();

        assert!(!store.volume_committed("v1").unwrap());

        std::fs::create_dir(dir.path().join("volumes/v1")).unwrap();
        assert!(
            !store.volume_committed("v1").unwrap(),
            "directory without sidecar is not committed"
        );

        store
            .write_volume_meta(
                "v1",
                &VolumeMeta {
                    size: 1,
                    digest: "sha256:ff".into(),
                },
            )
            .unwrap();
        assert!(store.volume_committed("v1").unwrap());
    }

    #[test]
    fn corrupt_sidecar_reads_as_absent() {
        let (dir, store) = temp_store();
        std::fs::write(dir.path().join("meta/volume-v1"), "{not json").unwrap();
        assert!(store.read_volume_meta("v1").unwrap().is_none());
    }

    #[test]
    fn dependency_registry_round_trip() {
        let (_dir, store) = temp_store();
        let chain = vec!["v1".to_string(), "v2".to_string()];

        store.write_image_dependencies("img", &chain).unwrap();
        assert_eq!(store.read_image_dependencies("img").unwrap().unwrap(), chain);

        let referenced = store.referenced_volume_ids().unwrap();
        assert!(referenced.contains("v1"));
        assert!(referenced.contains("v2"));

        store.remove_image_dependencies("img").unwrap();
        assert!(store.read_image_dependencies("img").unwrap().is_none());
        assert!(store.referenced_volume_ids().unwrap().is_empty());
    }

    #[test]
    fn committed_bytes_sums_sidecars() {
        let (_dir, store) = temp_store();
        store
            .write_volume_meta("a", &VolumeMeta { size: 100, digest: "sha256:aa".into() })
            .unwrap();
        store
            .write_volume_meta("b", &VolumeMeta { size: 250, digest: "sha256:bb".into() })
            .unwrap();
        assert_eq!(store.committed_volume_bytes().unwrap(), 350);
    }

    #[test]
    fn ownership_check_accepts_current_user_identity_mapping() {
        let (_dir, store) = temp_store();
        store.validate_ownership(&IdMappings::default()).unwrap();
    }

    #[test]
    fn ownership_check_rejects_foreign_mapping() {
        let (_dir, store) = temp_store();
        // Map namespace root far away from whoever owns the tempdir.
        let mappings = IdMappings::new(vec![IdMap::new(0, 4_000_000, 1)], vec![]);
        assert!(matches!(
            store.validate_ownership(&mappings),
            Err(StoreError::StoreInvalid(_))
        ));
    }

    #[test]
    fn mapping_consistency_enforced_after_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &IdMappings::default(), Some(1 << 30)).unwrap();

        store.validate_mapping(&IdMappings::default()).unwrap();

        let other = IdMappings::new(vec![IdMap::new(0, 100000, 65536)], vec![]);
        assert!(matches!(
            store.validate_mapping(&other),
            Err(StoreError::StoreInvalid(_))
        ));
    }

    #[test]
    fn uninitialized_store_accepts_any_mapping() {
        let (_dir, store) = temp_store();
        let mapped = IdMappings::new(vec![IdMap::new(0, 100000, 65536)], vec![]);
        store.validate_mapping(&mapped).unwrap();
    }
}
