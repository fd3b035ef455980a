//! Helper process for unprivileged unpacking.
//!
//! When the invocation is not root but an id mapping is configured, layer
//! ownership cannot be applied directly: chown to the mapped host ids
//! requires privilege. Instead the unpack runs in a re-executed copy of
//! this binary inside a fresh user namespace:
//!
//! 1. The parent spawns `/proc/self/exe` with the unpack request JSON in
//!    an environment variable and the tar stream attached to stdin.
//! 2. The child unshares a user namespace and reports `ready` on stdout.
//! 3. The parent establishes the child's uid/gid maps (directly through
//!    `/proc/<pid>/…_map` for single-range mappings, via the setuid
//!    `newuidmap`/`newgidmap` helpers otherwise) and only then starts
//!    writing tar bytes.
//! 4. The child, now namespace root, unpacks stdin with ownership applied
//!    using the namespace-side ids (the kernel translates to the host
//!    range), then prints the unpack stats as JSON.
//!
//! The binary must call [`init_if_helper`] before any other processing so
//! the re-executed copy takes the helper path.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::idmap::{IdMap, IdMappings};
use crate::unpack::{UnpackOptions, Unpacker, UnpackStats};

/// Environment variable carrying the helper request. Its presence marks
/// the process as a helper.
const HELPER_ENV: &str = "ROOTSTOR_UNPACK_SPEC";

/// Line the child prints once its namespace exists.
const READY_LINE: &str = "ready";

/// Request handed to the helper process.
#[derive(Debug, Serialize, Deserialize)]
struct HelperRequest {
    target: PathBuf,
    digest: String,
    uid_mappings: Vec<IdMap>,
    gid_mappings: Vec<IdMap>,
}

/// Helper outcome, printed as one JSON line on stdout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HelperReply {
    Ok { bytes_on_disk: u64, entries: u64 },
    Err { message: String },
}

/// True when this mapping/privilege combination needs the helper.
pub fn needs_helper(mappings: &IdMappings) -> bool {
    !mappings.is_identity() && !rustix::process::geteuid().is_root()
}

/// Run the helper loop if this process was spawned as one. Never returns
/// in that case. Must be called at the top of `main`.
pub fn init_if_helper() {
    if std::env::var_os(HELPER_ENV).is_none() {
        return;
    }
    let reply = match run_helper() {
        Ok(stats) => HelperReply::Ok {
            bytes_on_disk: stats.bytes_on_disk,
            entries: stats.entries,
        },
        Err(e) => HelperReply::Err {
            message: format!("{e:#}"),
        },
    };
    let failed = matches!(reply, HelperReply::Err { .. });
    // Stdout going away means the parent is gone; the exit code is all
    // that is left to report.
    if let Ok(line) = serde_json::to_string(&reply) {
        let _ = writeln!(std::io::stdout(), "{line}");
    }
    std::process::exit(if failed { 1 } else { 0 });
}

fn run_helper() -> anyhow::Result<UnpackStats> {
    let raw = std::env::var(HELPER_ENV)?;
    let request: HelperRequest = serde_json::from_str(&raw)?;

    rustix::thread::unshare(rustix::thread::UnshareFlags::NEWUSER)?;

    // Tell the parent the namespace exists, then block on stdin: bytes
    // only start flowing after the parent has written our id maps.
    {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{READY_LINE}")?;
        stdout.flush()?;
    }

    let target = Dir::open_ambient_dir(&request.target, ambient_authority())?;
    let unpacker = Unpacker::new(UnpackOptions {
        // Ownership is applied with the namespace-side ids; the kernel
        // maps them onto the configured host ranges.
        mappings: IdMappings::default(),
        preserve_ownership: true,
    });
    let stats = unpacker.unpack(&request.digest, std::io::stdin().lock(), &target)?;
    Ok(stats)
}

/// Spawn the helper, stream `blob` to it, and collect the unpack stats.
pub fn spawn_unpack_helper(
    target: &Path,
    digest: &str,
    mappings: &IdMappings,
    mut blob: impl Read,
) -> Result<UnpackStats> {
    let request = HelperRequest {
        target: target.to_path_buf(),
        digest: digest.to_string(),
        uid_mappings: mappings.uid.clone(),
        gid_mappings: mappings.gid.clone(),
    };

    let exe = std::fs::read_link("/proc/self/exe")?;
    let mut child = Command::new(exe)
        .env(HELPER_ENV, serde_json::to_string(&request)?)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let result = drive_helper(&mut child, &request, &mut blob);
    if result.is_err() {
        let _ = child.kill();
    }
    let status = child.wait()?;
    let stats = result?;
    if !status.success() {
        return Err(helper_error(format!("unpack helper exited with {status}")));
    }
    Ok(stats)
}

fn drive_helper(
    child: &mut std::process::Child,
    request: &HelperRequest,
    blob: &mut impl Read,
) -> Result<UnpackStats> {
    let mut stdout = BufReader::new(child.stdout.take().expect("helper stdout is piped"));

    let mut line = String::new();
    stdout.read_line(&mut line)?;
    if line.trim() != READY_LINE {
        return Err(helper_error(format!("unexpected helper greeting: {line:?}")));
    }

    write_child_id_mappings(child.id(), &request.uid_mappings, &request.gid_mappings)?;

    {
        let mut stdin = child.stdin.take().expect("helper stdin is piped");
        std::io::copy(blob, &mut stdin)?;
        // Dropping stdin closes the pipe; the helper sees EOF.
    }

    line.clear();
    stdout.read_line(&mut line)?;
    match serde_json::from_str(&line)? {
        HelperReply::Ok {
            bytes_on_disk,
            entries,
        } => Ok(UnpackStats {
            bytes_on_disk,
            entries,
        }),
        HelperReply::Err { message } => Err(helper_error(message)),
    }
}

fn helper_error(message: String) -> StoreError {
    StoreError::Io(std::io::Error::other(format!("unpack helper: {message}")))
}

/// Establish a child's uid/gid maps. Single-range mappings are written
/// directly to the proc files; multi-range mappings need the setuid
/// `newuidmap`/`newgidmap` binaries.
fn write_child_id_mappings(pid: u32, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<()> {
    // Denying setgroups is required before an unprivileged gid_map write.
    std::fs::write(format!("/proc/{pid}/setgroups"), "deny")?;

    write_one_mapping(pid, "gid_map", "newgidmap", gid_maps)?;
    write_one_mapping(pid, "uid_map", "newuidmap", uid_maps)?;
    Ok(())
}

fn write_one_mapping(pid: u32, proc_file: &str, binary: &str, maps: &[IdMap]) -> Result<()> {
    if maps.len() <= 1 {
        let line = maps.first().map(IdMap::to_proc_format).unwrap_or_else(|| {
            // No triples configured: map namespace root to ourselves.
            let own = if proc_file == "uid_map" {
                rustix::process::geteuid().as_raw()
            } else {
                rustix::process::getegid().as_raw()
            };
            IdMap::new(0, own, 1).to_proc_format()
        });
        std::fs::write(format!("/proc/{pid}/{proc_file}"), line)?;
        return Ok(());
    }

    let mut args = vec![pid.to_string()];
    for map in maps {
        args.push(map.namespace_id.to_string());
        args.push(map.host_id.to_string());
        args.push(map.size.to_string());
    }
    let status = Command::new(binary).args(&args).status()?;
    if !status.success() {
        return Err(helper_error(format!("{binary} exited with {status}")));
    }
    Ok(())
}
