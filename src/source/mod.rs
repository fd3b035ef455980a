//! Layer sources: where image content comes from.
//!
//! A [`LayerSource`] resolves an image reference into an ordered layer
//! list plus the image config blob, and can open the raw tar byte stream
//! for any of those layers. The provisioner core only ever sees this
//! interface; the registry transport lives behind it.
//!
//! Two implementations exist: [`remote::RemoteSource`] for OCI/Docker
//! registries and [`local::LocalDirSource`], which fabricates a single
//! synthetic layer from a directory tree.

pub mod local;
pub mod remote;

use std::io::Read;
use std::path::PathBuf;

use crate::error::{Result, StoreError};

/// A reference to provisionable image content.
#[derive(Debug, Clone)]
pub enum ImageRef {
    /// A local directory whose contents become a single layer.
    Local(PathBuf),
    /// A remote registry reference (repository plus tag or digest).
    Remote(oci_client::Reference),
}

impl ImageRef {
    /// Parse a caller-supplied reference string.
    ///
    /// `docker://` references are remote; everything else is treated as a
    /// local directory path, which keeps bare strings like `ubuntu` from
    /// silently hitting the network.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(remote) = raw.strip_prefix("docker://") {
            let reference: oci_client::Reference =
                remote.parse().map_err(|e| StoreError::ReferenceInvalid {
                    reference: raw.to_string(),
                    reason: format!("{e}"),
                })?;
            return Ok(ImageRef::Remote(reference));
        }
        if raw.is_empty() {
            return Err(StoreError::ReferenceInvalid {
                reference: raw.to_string(),
                reason: "empty reference".into(),
            });
        }
        Ok(ImageRef::Local(PathBuf::from(raw)))
    }

    /// Build the layer source for this reference.
    pub fn open_source(&self) -> Result<Box<dyn LayerSource>> {
        match self {
            ImageRef::Local(path) => Ok(Box::new(local::LocalDirSource::new(path)?)),
            ImageRef::Remote(reference) => {
                Ok(Box::new(remote::RemoteSource::new(reference.clone())?))
            }
        }
    }
}

/// One layer as described by an image manifest, base to top order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Content digest, `algorithm:hex`.
    pub digest: String,
    /// Blob size in bytes as recorded in the manifest (0 when unknown).
    pub size: u64,
    /// Media type of the blob; determines decompression.
    pub media_type: String,
}

/// The resolved content of an image reference.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// The OCI image configuration blob, verbatim.
    pub config: Vec<u8>,
    /// Layers in application order (base first).
    pub layers: Vec<Layer>,
}

/// Yields the layer list for an image and a tar stream per layer.
pub trait LayerSource {
    /// Resolve the reference into config plus ordered layers.
    fn manifest(&self) -> Result<ResolvedImage>;

    /// Open the uncompressed tar stream for one layer.
    ///
    /// The stream may fail mid-read; callers discard any partial unpack.
    fn blob(&self, layer: &Layer) -> Result<Box<dyn Read + Send>>;
}

/// Validate an `algorithm:hex` digest string.
pub fn validate_digest(digest: &str) -> Result<()> {
    let valid = digest.split_once(':').is_some_and(|(algo, hex)| {
        !algo.is_empty()
            && algo
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && !hex.is_empty()
            && hex.chars().all(|c| c.is_ascii_hexdigit())
    });
    if !valid {
        return Err(StoreError::LayerCorrupt {
            digest: digest.to_string(),
            reason: "malformed digest".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_remote_reference() {
        let parsed = ImageRef::parse("docker://docker.io/library/alpine:3.20").unwrap();
        match parsed {
            ImageRef::Remote(reference) => {
                assert_eq!(reference.registry(), "docker.io");
                assert_eq!(reference.repository(), "library/alpine");
                assert_eq!(reference.tag(), Some("3.20"));
            }
            other => panic!("expected remote, got {other:?}"),
        }
    }

    #[test]
    fn parse_remote_digest_reference() {
        let raw = format!("docker://quay.io/app/base@sha256:{}", "ab".repeat(32));
        let parsed = ImageRef::parse(&raw).unwrap();
        match parsed {
            ImageRef::Remote(reference) => assert!(reference.digest().is_some()),
            other => panic!("expected remote, got {other:?}"),
        }
    }

    #[test]
    fn parse_local_path() {
        let parsed = ImageRef::parse("/tmp/rootfs-src").unwrap();
        assert!(matches!(parsed, ImageRef::Local(p) if p == PathBuf::from("/tmp/rootfs-src")));
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(matches!(
            ImageRef::parse(""),
            Err(StoreError::ReferenceInvalid { .. })
        ));
    }

    #[test]
    fn parse_rejects_garbage_remote() {
        let err = ImageRef::parse("docker://:::").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn digest_validation() {
        validate_digest(&format!("sha256:{}", "0a".repeat(32))).unwrap();
        assert!(validate_digest("sha256").is_err());
        assert!(validate_digest("sha256:").is_err());
        assert!(validate_digest(":abcd").is_err());
        assert!(validate_digest("sha256:xyz").is_err());
    }
}
