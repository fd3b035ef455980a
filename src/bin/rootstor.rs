//! rootstor: provision root filesystems for container runtimes.
//!
//! One short-lived invocation per operation:
//!
//! ```bash
//! # Initialize a store on an XFS mount
//! rootstor --store /var/lib/rootstor init-store --uid-mapping 0:100000:65536
//!
//! # Materialize a rootfs from a registry image
//! rootstor --store /var/lib/rootstor create docker://docker.io/library/alpine:3.20 my-app
//!
//! # ... or from a local directory
//! rootstor create /srv/base-rootfs my-app --disk-limit-size-bytes 1073741824
//!
//! # Usage, teardown, volume collection
//! rootstor stats my-app
//! rootstor delete my-app
//! rootstor clean --threshold-bytes 10737418240
//! ```
//!
//! Exit codes: 0 success, 1 failure, 2 invalid arguments or references.
//!
//! Unprivileged invocations with `--uid-mapping`/`--gid-mapping` re-exec
//! this binary as an unpack helper inside a user namespace; the helper
//! hook must therefore run before anything else in `main`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rootstor::driver::Driver;
use rootstor::gc::{GarbageCollector, keep_set};
use rootstor::idmap::{IdMap, IdMappings};
use rootstor::image_store::{ImageSpec, ImageStore};
use rootstor::metrics::NoopSink;
use rootstor::source::ImageRef;
use rootstor::store::Store;
use rootstor::volume_cache::VolumeCache;
use rootstor::StoreError;

#[derive(Parser)]
#[command(name = "rootstor")]
#[command(about = "Provision root filesystems for container runtimes", long_about = None)]
struct Cli {
    /// Path to the store
    #[arg(long, global = true, default_value = "/var/lib/rootstor")]
    store: PathBuf,

    /// Log filter (e.g. "debug" or "rootstor=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize a root filesystem from an image reference
    Create {
        /// docker://registry/repo[:tag|@digest], or a local directory
        image_ref: String,
        /// Id for the new image
        image_id: String,
        /// Disk limit in bytes (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        disk_limit_size_bytes: u64,
        /// Count only writes into the image against the limit
        #[arg(long)]
        exclude_image_from_quota: bool,
        /// Uid mapping triple, namespace-start:host-start:length (repeatable)
        #[arg(long = "uid-mapping", value_name = "NS:HOST:LEN")]
        uid_mappings: Vec<IdMap>,
        /// Gid mapping triple, namespace-start:host-start:length (repeatable)
        #[arg(long = "gid-mapping", value_name = "NS:HOST:LEN")]
        gid_mappings: Vec<IdMap>,
        /// Store this OCI image config instead of the source's
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Destroy an image; absent images delete successfully
    Delete {
        /// Id of the image to remove
        image_id: String,
    },

    /// Print an image's disk usage as JSON
    Stats {
        /// Id of the image to measure
        image_id: String,
    },

    /// Remove volumes no image references
    Clean {
        /// Skip collection while the store holds at most this many bytes
        #[arg(long, default_value_t = 0)]
        threshold_bytes: u64,
        /// Layer digest or volume id to keep (repeatable)
        #[arg(long = "ignore-image", value_name = "DIGEST")]
        ignore_image: Vec<String>,
    },

    /// Initialize and validate the store
    InitStore {
        /// Intended store size in bytes, recorded in the store metadata
        #[arg(long)]
        store_size_bytes: Option<u64>,
        /// Uid mapping triple, namespace-start:host-start:length (repeatable)
        #[arg(long = "uid-mapping", value_name = "NS:HOST:LEN")]
        uid_mappings: Vec<IdMap>,
        /// Gid mapping triple, namespace-start:host-start:length (repeatable)
        #[arg(long = "gid-mapping", value_name = "NS:HOST:LEN")]
        gid_mappings: Vec<IdMap>,
    },
}

fn main() -> ExitCode {
    // A re-executed unpack helper must take its path before any CLI or
    // store processing happens.
    rootstor::userns_helper::init_if_helper();

    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rootstor: {e:#}");
            let code = e
                .downcast_ref::<StoreError>()
                .map(StoreError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Create {
            image_ref,
            image_id,
            disk_limit_size_bytes,
            exclude_image_from_quota,
            uid_mappings,
            gid_mappings,
            config,
        } => {
            let mappings = IdMappings::new(uid_mappings, gid_mappings);
            let store = Store::open(&cli.store).context("opening store")?;
            store.validate_mapping(&mappings)?;
            store.validate_ownership(&mappings)?;
            let driver = Driver::overlay_xfs(store.path());
            let metrics = NoopSink;

            let reference = ImageRef::parse(&image_ref)?;
            let source = reference.open_source()?;
            let resolved = source.manifest()?;

            let cache = VolumeCache::new(&store, &driver, &mappings, &metrics);
            let volume_chain = cache.provide(&*source, &resolved.layers, None)?;

            let config = match config {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => resolved.config,
            };

            let (owner_uid, owner_gid) = mappings.host_root();
            let images = ImageStore::new(&store, &driver, &metrics);
            let rootfs = images.create(&ImageSpec {
                image_id,
                volume_chain,
                disk_limit: disk_limit_size_bytes,
                exclude_image_from_quota,
                config,
                owner_uid,
                owner_gid,
            })?;
            println!("{}", rootfs.display());
        }

        Commands::Delete { image_id } => {
            let store = Store::open(&cli.store).context("opening store")?;
            let driver = Driver::overlay_xfs(store.path());
            let metrics = NoopSink;
            let images = ImageStore::new(&store, &driver, &metrics);
            images.delete(&image_id)?;
        }

        Commands::Stats { image_id } => {
            let store = Store::open(&cli.store).context("opening store")?;
            let driver = Driver::overlay_xfs(store.path());
            let metrics = NoopSink;
            let images = ImageStore::new(&store, &driver, &metrics);
            let stats = images.stats(&image_id)?;
            let output = serde_json::json!({ "disk_usage": stats });
            println!("{output}");
        }

        Commands::Clean {
            threshold_bytes,
            ignore_image,
        } => {
            let mappings = IdMappings::default();
            let store = Store::open(&cli.store).context("opening store")?;
            let driver = Driver::overlay_xfs(store.path());
            let metrics = NoopSink;
            let gc = GarbageCollector::new(&store, &driver, &metrics);
            let stats = gc.collect(&keep_set(&ignore_image, &mappings), threshold_bytes)?;
            println!(
                "removed {} volumes, reclaimed {} bytes",
                stats.volumes_removed, stats.bytes_reclaimed
            );
        }

        Commands::InitStore {
            store_size_bytes,
            uid_mappings,
            gid_mappings,
        } => {
            let mappings = IdMappings::new(uid_mappings, gid_mappings);

            // Root initializing a mapped store hands it to the mapping's
            // host root before the ownership check runs.
            std::fs::create_dir_all(&cli.store)?;
            if rustix::process::geteuid().is_root() && !mappings.is_identity() {
                let (uid, gid) = mappings.host_root();
                rustix::fs::chown(
                    &cli.store,
                    Some(rustix::fs::Uid::from_raw(uid)),
                    Some(rustix::fs::Gid::from_raw(gid)),
                )
                .map_err(std::io::Error::from)
                .context("assigning store ownership")?;
            }

            let store = Store::init(&cli.store, &mappings, store_size_bytes)?;
            let driver = Driver::overlay_xfs(store.path());
            driver.validate_filesystem()?;
        }
    }
    Ok(())
}
