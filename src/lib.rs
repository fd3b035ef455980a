#![deny(unsafe_code)]
//! Root filesystem provisioner for container runtimes.
//!
//! Given an image reference, either a local directory or a remote
//! OCI/Docker registry reference, this library materializes a ready-to-use
//! root filesystem on disk, deprovisions it again, and reports disk usage.
//! It is built to be driven by a short-lived CLI once per operation;
//! concurrent invocations coordinate through file locks, never through
//! shared process state.
//!
//! # Pipeline
//!
//! A `create` flows top-down through:
//!
//! 1. [`source`] resolves the reference into an ordered layer list and
//!    opens a tar stream per layer.
//! 2. [`volume_cache`] turns each layer into a committed, content-addressed
//!    volume under the store, unpacking each digest at most once across
//!    concurrent invocations (see [`locksmith`] and [`unpack`]).
//! 3. [`image_store`] composes the volumes into a writable rootfs through
//!    the filesystem [`driver`] (overlay mounts over XFS, with project
//!    quotas for disk limits).
//!
//! `delete` tears the image down through the driver; [`gc`] removes
//! volumes no image references anymore.
//!
//! # Store
//!
//! All persistent state lives under a caller-chosen store path; see
//! [`store`] for the layout. Volumes are keyed by layer digest plus the
//! id-mapping fingerprint ([`idmap`]), so the same image pulled under
//! different user-namespace mappings never shares unpacked trees.
//!
//! # Unprivileged operation
//!
//! When invoked without privilege but with id mappings, unpacking runs in
//! a re-executed helper inside a user namespace; see [`userns_helper`].
//!
//! # Example
//!
//! ```no_run
//! use rootstor::driver::Driver;
//! use rootstor::idmap::IdMappings;
//! use rootstor::image_store::{ImageSpec, ImageStore};
//! use rootstor::metrics::NoopSink;
//! use rootstor::source::ImageRef;
//! use rootstor::store::Store;
//! use rootstor::volume_cache::VolumeCache;
//!
//! let store = Store::open("/var/lib/rootstor")?;
//! let driver = Driver::overlay_xfs(store.path());
//! let mappings = IdMappings::default();
//! let metrics = NoopSink;
//!
//! let source = ImageRef::parse("docker://docker.io/library/alpine:3.20")?.open_source()?;
//! let resolved = source.manifest()?;
//! let cache = VolumeCache::new(&store, &driver, &mappings, &metrics);
//! let chain = cache.provide(&*source, &resolved.layers, None)?;
//!
//! let images = ImageStore::new(&store, &driver, &metrics);
//! let rootfs = images.create(&ImageSpec {
//!     image_id: "my-container".into(),
//!     volume_chain: chain,
//!     disk_limit: 0,
//!     exclude_image_from_quota: false,
//!     config: resolved.config,
//!     owner_uid: 0,
//!     owner_gid: 0,
//! })?;
//! println!("rootfs at {}", rootfs.display());
//! # Ok::<(), rootstor::StoreError>(())
//! ```

pub mod driver;
pub mod error;
pub mod gc;
pub mod idmap;
pub mod image_store;
pub mod locksmith;
pub mod metrics;
pub mod source;
pub mod store;
pub mod unpack;
pub mod userns_helper;
pub mod volume_cache;

pub use driver::{Driver, ImageDriverSpec, VolumeStats};
pub use error::{Result, StoreError};
pub use gc::{CollectStats, GarbageCollector};
pub use idmap::{IdMap, IdMappings};
pub use image_store::{ImageSpec, ImageStore};
pub use locksmith::{LockGuard, LockMode, Locksmith};
pub use metrics::{MetricSink, NoopSink};
pub use source::{ImageRef, Layer, LayerSource, ResolvedImage};
pub use store::{Store, VolumeMeta};
pub use unpack::{UnpackOptions, UnpackStats, Unpacker};
pub use volume_cache::{VolumeCache, volume_id};
