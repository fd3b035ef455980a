//! Error types for the rootstor library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, StoreError>`. There is a single error enum for the whole
//! crate: each variant carries a short tag describing what failed plus the
//! underlying cause, instead of a chain of string-wrapped errors. The
//! binary prints the full `source()` chain and translates the variant into
//! the process exit code via [`StoreError::exit_code`].

use std::path::PathBuf;

/// Result type alias for operations that may return a [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error kinds distinguished by the provisioner core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The image reference could not be parsed.
    #[error("invalid image reference `{reference}`: {reason}")]
    ReferenceInvalid {
        /// The reference as supplied by the caller.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The layer source failed while fetching a manifest or blob.
    #[error("fetching {what}")]
    FetchTransport {
        /// What was being fetched (manifest, config, or a layer digest).
        what: String,
        /// The transport-level cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A layer's bytes did not match its digest, or the tar stream was bad.
    #[error("corrupt layer {digest}: {reason}")]
    LayerCorrupt {
        /// Digest of the offending layer.
        digest: String,
        /// What went wrong.
        reason: String,
    },

    /// A tar entry's owner falls outside every configured mapping range.
    #[error("{kind} {id} is not covered by the configured {kind} mappings")]
    UnmappableId {
        /// "uid" or "gid".
        kind: &'static str,
        /// The unmapped namespace id.
        id: u32,
    },

    /// Applying or reporting the disk quota failed.
    #[error("disk quota on {path}: {reason}")]
    Quota {
        /// The subtree the quota applies to.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The overlay mount failed. Partially created image directories have
    /// already been removed when this is returned.
    #[error("mounting overlay on {target}")]
    MountFailed {
        /// The intended rootfs mount point.
        target: PathBuf,
        /// The mount(2) error.
        #[source]
        source: std::io::Error,
    },

    /// An image with this id already exists in the store.
    #[error("image `{0}` already exists")]
    AlreadyExists(String),

    /// The requested volume does not exist.
    #[error("volume `{0}` does not exist")]
    VolumeNotFound(String),

    /// The requested image does not exist. `delete` treats this as
    /// success; other operations surface it.
    #[error("image `{0}` does not exist")]
    ImageNotFound(String),

    /// The store failed validation (wrong filesystem, wrong owner, or
    /// initialized under a different id mapping).
    #[error("invalid store: {0}")]
    StoreInvalid(String),

    /// The caller-supplied deadline elapsed between pipeline steps.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// I/O error during store or unpack operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of persisted metadata failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// The process exit code this error maps to.
    ///
    /// Malformed references are usage errors (2); everything else is a
    /// general failure (1). Successful paths, including deleting an image
    /// that does not exist, never reach this.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::ReferenceInvalid { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_errors_are_usage_errors() {
        let err = StoreError::ReferenceInvalid {
            reference: "???".into(),
            reason: "unparseable".into(),
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn other_errors_are_general_failures() {
        assert_eq!(StoreError::AlreadyExists("img".into()).exit_code(), 1);
        assert_eq!(StoreError::DeadlineExceeded.exit_code(), 1);
        assert_eq!(
            StoreError::UnmappableId { kind: "uid", id: 9 }.exit_code(),
            1
        );
    }

    #[test]
    fn mount_failed_preserves_cause() {
        use std::error::Error;
        let err = StoreError::MountFailed {
            target: PathBuf::from("/store/images/a/rootfs"),
            source: std::io::Error::from_raw_os_error(libc::ENODEV),
        };
        assert!(err.source().is_some());
    }
}
