//! Uid/gid mapping tables for unprivileged stores.
//!
//! A mapping is an ordered list of `(namespace-start, host-start, length)`
//! triples, one list for uids and one for gids, in the same shape the
//! kernel's `/proc/<pid>/uid_map` uses. The CLI accepts them as repeatable
//! `ns:host:len` arguments.
//!
//! Two derived values matter to the store:
//!
//! - **translation**: a namespace id is rewritten to the corresponding host
//!   id when unpacking layer content; ids outside every range are an error.
//! - **fingerprint**: a stable hash over the sorted triples. Volume ids mix
//!   the fingerprint in so the same layer unpacked under different mappings
//!   never aliases.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

/// A single id mapping triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the namespace.
    pub namespace_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids covered.
    pub size: u32,
}

impl IdMap {
    /// Create a new mapping triple.
    pub fn new(namespace_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            namespace_id,
            host_id,
            size,
        }
    }

    /// Format for writing to `/proc/<pid>/uid_map` or `gid_map`.
    pub fn to_proc_format(&self) -> String {
        format!("{} {} {}", self.namespace_id, self.host_id, self.size)
    }

    fn contains(&self, id: u32) -> bool {
        id >= self.namespace_id && (id - self.namespace_id) < self.size
    }
}

impl FromStr for IdMap {
    type Err = String;

    /// Parse a `namespace-start:host-start:length` triple.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!(
                "expected namespace-start:host-start:length, got `{s}`"
            ));
        }
        let parse = |field: &str, what: &str| {
            field
                .parse::<u32>()
                .map_err(|_| format!("invalid {what} `{field}` in `{s}`"))
        };
        let map = IdMap::new(
            parse(parts[0], "namespace start")?,
            parse(parts[1], "host start")?,
            parse(parts[2], "length")?,
        );
        if map.size == 0 {
            return Err(format!("zero-length mapping `{s}`"));
        }
        Ok(map)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace_id, self.host_id, self.size)
    }
}

/// The full uid and gid mapping configuration for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    /// Uid triples, in caller order.
    pub uid: Vec<IdMap>,
    /// Gid triples, in caller order.
    pub gid: Vec<IdMap>,
}

impl IdMappings {
    /// Build mappings from parsed CLI triples.
    pub fn new(uid: Vec<IdMap>, gid: Vec<IdMap>) -> Self {
        Self { uid, gid }
    }

    /// An empty mapping translates every id to itself.
    pub fn is_identity(&self) -> bool {
        self.uid.is_empty() && self.gid.is_empty()
    }

    /// Translate a namespace uid to its host uid.
    pub fn map_uid(&self, id: u32) -> Result<u32> {
        Self::translate(&self.uid, id).ok_or(StoreError::UnmappableId { kind: "uid", id })
    }

    /// Translate a namespace gid to its host gid.
    pub fn map_gid(&self, id: u32) -> Result<u32> {
        Self::translate(&self.gid, id).ok_or(StoreError::UnmappableId { kind: "gid", id })
    }

    fn translate(maps: &[IdMap], id: u32) -> Option<u32> {
        if maps.is_empty() {
            return Some(id);
        }
        maps.iter()
            .find(|m| m.contains(id))
            .map(|m| m.host_id + (id - m.namespace_id))
    }

    /// The host ids that namespace root (0:0) maps to.
    ///
    /// With an identity mapping this is the current effective uid/gid: an
    /// unmapped store is owned by whoever runs the tool.
    pub fn host_root(&self) -> (u32, u32) {
        let uid = Self::translate(&self.uid, 0)
            .unwrap_or_else(|| rustix::process::geteuid().as_raw());
        let gid = Self::translate(&self.gid, 0)
            .unwrap_or_else(|| rustix::process::getegid().as_raw());
        // Identity translation of 0 still means "whoever owns the store"
        // when no triples were configured at all.
        if self.is_identity() {
            (
                rustix::process::geteuid().as_raw(),
                rustix::process::getegid().as_raw(),
            )
        } else {
            (uid, gid)
        }
    }

    /// Stable fingerprint over the sorted triples.
    ///
    /// Triple order as given by the caller does not matter; the set does.
    /// The identity mapping has its own fixed fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut uid = self.uid.clone();
        let mut gid = self.gid.clone();
        uid.sort_by_key(|m| (m.namespace_id, m.host_id, m.size));
        gid.sort_by_key(|m| (m.namespace_id, m.host_id, m.size));

        let mut hasher = Sha256::new();
        for m in &uid {
            hasher.update(b"uid:");
            hasher.update(m.to_proc_format().as_bytes());
            hasher.update(b"\n");
        }
        for m in &gid {
            hasher.update(b"gid:");
            hasher.update(m.to_proc_format().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
