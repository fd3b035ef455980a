//! Local directory layer source.
//!
//! A local reference is materialized as a single synthetic layer: the
//! directory is archived on the fly and streamed to the unpacker through a
//! pipe, so the tree is never buffered in memory. The synthetic digest is
//! derived from the canonical path and the directory's mtime: re-creating
//! from an unchanged directory reuses the cached volume, while touching
//! the directory produces a new digest and a fresh unpack.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;

use sha2::{Digest, Sha256};

use super::{Layer, LayerSource, ResolvedImage};
use crate::error::{Result, StoreError};

/// Media type reported for the synthetic layer.
const LOCAL_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Layer source backed by a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalDirSource {
    path: PathBuf,
    digest: String,
}

impl LocalDirSource {
    /// Create a source for `path`, which must be an existing directory.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = path.as_ref();
        let path = raw
            .canonicalize()
            .map_err(|e| StoreError::ReferenceInvalid {
                reference: raw.display().to_string(),
                reason: format!("{e}"),
            })?;
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(StoreError::ReferenceInvalid {
                reference: path.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(b"local:");
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(format!(":{}:{}", meta.mtime(), meta.mtime_nsec()).as_bytes());
        let digest = format!("sha256:{:x}", hasher.finalize());

        Ok(Self { path, digest })
    }

    /// The synthetic digest assigned to the directory's current state.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl LayerSource for LocalDirSource {
    fn manifest(&self) -> Result<ResolvedImage> {
        Ok(ResolvedImage {
            // A local directory has no image configuration of its own.
            config: b"{}".to_vec(),
            layers: vec![Layer {
                digest: self.digest.clone(),
                size: 0,
                media_type: LOCAL_LAYER_MEDIA_TYPE.to_string(),
            }],
        })
    }

    fn blob(&self, layer: &Layer) -> Result<Box<dyn Read + Send>> {
        if layer.digest != self.digest {
            return Err(StoreError::LayerCorrupt {
                digest: layer.digest.clone(),
                reason: "unknown digest for local source".into(),
            });
        }

        let (read_end, write_end) = rustix::pipe::pipe().map_err(std::io::Error::from)?;
        let source_path = self.path.clone();

        // Archive writer thread; the unpacker consumes the read end. An
        // archiving error closes the pipe early and surfaces to the reader
        // as a truncated tar stream.
        thread::spawn(move || {
            let mut builder = tar::Builder::new(File::from(write_end));
            builder.follow_symlinks(false);
            let result = builder
                .append_dir_all(".", &source_path)
                .and_then(|()| builder.finish());
            if let Err(e) = result {
                tracing::warn!(
                    source = %source_path.display(),
                    error = %e,
                    "archiving local directory failed"
                );
            }
        });

        Ok(Box::new(File::from(read_end)))
    }
}
