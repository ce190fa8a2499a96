//! # Restore Engine
//!
//! Materializes a snapshot (or any subtree of one) back onto the
//! filesystem by walking objects from the root downward: fetch, verify,
//! decode, write, recurse.
//!
//! Restore is best-effort by design: corrupt or missing objects, unwritable
//! paths, and unsupported property operations are logged and skipped so one
//! bad object cannot sink an otherwise recoverable snapshot. Only a payload
//! of a type that has no business appearing in a tree walk aborts — that is
//! a bug, not a repository condition.

use crate::cache::SnapshotRecord;
use crate::codec::{self, Contents, FileInfo, Payload, TreeInfo};
use crate::crypto::ObjectId;
use crate::error::{Error, Result};
use crate::repo::Repository;
use filetime::FileTime;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Restores a snapshot's root object into `dest`.
pub fn restore_snapshot(
    repo: &Repository,
    snapshot: &SnapshotRecord,
    dest: &Path,
    key: Option<&crypto_box::SecretKey>,
) -> Result<()> {
    restore_item(repo, &snapshot.root_id, dest, key)
}

/// Restores the given object to the given path, recursing through tree
/// objects. The last component of `path` is the item being restored and is
/// created if missing.
pub fn restore_item(
    repo: &Repository,
    objid: &ObjectId,
    path: &Path,
    key: Option<&crypto_box::SecretKey>,
) -> Result<()> {
    let payload = match repo.get_object(objid, key) {
        Ok(payload) => payload,
        Err(Error::Corrupt(e)) => {
            error!(path = %path.display(), error = %e, "cannot restore");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let decoded = match codec::decode(&payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            // The payload downloaded, decrypted, and matched its hash, yet
            // does not parse: either a bug or a malicious writer with the key.
            error!(
                path = %path.display(),
                objid = %objid.short(),
                error = %e,
                "object has an invalid payload; this may be a bug"
            );
            return Ok(());
        }
    };

    match decoded {
        Payload::Inode { info, contents } => restore_file(repo, path, &info, &contents, key),
        Payload::Tree { info, entries } => restore_tree(repo, path, &info, &entries, key),
        Payload::Symlink { info, target } => {
            restore_symlink(path, &info, &target);
            Ok(())
        }
        Payload::Blob(_) => panic!(
            "restore reached a blob object at {}; this is a bug",
            path.display(),
        ),
        Payload::Snapshot { .. } => panic!(
            "restore reached a snapshot object at {}; this is a bug",
            path.display(),
        ),
    }
}

fn restore_file(
    repo: &Repository,
    path: &Path,
    info: &FileInfo,
    contents: &Contents,
    key: Option<&crypto_box::SecretKey>,
) -> Result<()> {
    if path.exists() && !path.is_file() {
        error!(
            path = %path.display(),
            "cannot restore: path exists but is not a file"
        );
        return Ok(());
    }
    info!(path = %path.display(), "restoring file");

    let write_result = (|| -> std::io::Result<()> {
        let mut out = File::create(path)?;
        match contents {
            Contents::Immediate(data) => out.write_all(data)?,
            Contents::ChunkList(chunks) => {
                for (offset, chunk_id) in chunks {
                    let chunk_payload = match repo.get_object(chunk_id, key) {
                        Ok(p) => p,
                        Err(Error::Corrupt(e)) => {
                            error!(
                                path = %path.display(),
                                offset,
                                error = %e,
                                "could not restore chunk"
                            );
                            continue;
                        }
                        // Anything else (e.g. a missing key) would fail every
                        // chunk the same way; surface it as an I/O failure.
                        Err(e) => {
                            return Err(std::io::Error::other(e.to_string()));
                        }
                    };
                    let data = match codec::decode_blob(&chunk_payload) {
                        Ok(data) => data,
                        Err(e) => {
                            error!(
                                path = %path.display(),
                                offset,
                                error = %e,
                                "chunk is not a valid blob"
                            );
                            continue;
                        }
                    };
                    out.seek(SeekFrom::Start(*offset))?;
                    out.write_all(&data)?;
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = write_result {
        error!(path = %path.display(), error = %e, "error writing file");
        return Ok(());
    }

    apply_properties(path, info.uid, info.gid, info.mode, info.atime_ns, info.mtime_ns);
    Ok(())
}

fn restore_tree(
    repo: &Repository,
    path: &Path,
    info: &TreeInfo,
    entries: &[(Vec<u8>, ObjectId)],
    key: Option<&crypto_box::SecretKey>,
) -> Result<()> {
    if path.exists() && !path.is_dir() {
        error!(
            path = %path.display(),
            "cannot restore: path exists but is not a directory"
        );
        return Ok(());
    }

    if !path.exists() {
        let mut builder = fs::DirBuilder::new();
        builder.mode(info.mode & 0o7777);
        if let Err(e) = builder.create(path) {
            error!(path = %path.display(), error = %e, "could not make directory");
            return Ok(());
        }
    }

    for (name, child_id) in entries {
        let name = OsStr::from_bytes(name);
        restore_item(repo, child_id, &path.join(name), key)?;
    }

    // Properties go on after the children: creating entries inside the
    // directory would reset its mtime.
    apply_properties(path, info.uid, info.gid, info.mode, info.atime_ns, info.mtime_ns);
    Ok(())
}

fn restore_symlink(path: &Path, info: &TreeInfo, target: &[u8]) {
    let target = OsStr::from_bytes(target);
    if let Err(e) = std::os::unix::fs::symlink(target, path) {
        error!(path = %path.display(), error = %e, "could not create symlink");
        return;
    }

    // Apply what the platform supports without following the link; symlink
    // permission bits are not a thing on Linux.
    if let Err(e) = std::os::unix::fs::lchown(path, Some(info.uid), Some(info.gid)) {
        warn!(path = %path.display(), error = %e, "could not chown symlink");
    }
    debug!(path = %path.display(), "symlink mode not supported on this platform, skipping");
    if let Err(e) = filetime::set_symlink_file_times(
        path,
        file_time(info.atime_ns),
        file_time(info.mtime_ns),
    ) {
        warn!(path = %path.display(), error = %e, "could not set symlink times");
    }
}

/// Sets owner, group, mode, and timestamps, logging (never failing) on each
/// unsupported or denied operation.
fn apply_properties(path: &Path, uid: u32, gid: u32, mode: u32, atime_ns: i64, mtime_ns: i64) {
    if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        warn!(path = %path.display(), error = %e, "could not chown");
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
        warn!(path = %path.display(), error = %e, "could not chmod");
    }
    if let Err(e) = filetime::set_file_times(path, file_time(atime_ns), file_time(mtime_ns)) {
        warn!(path = %path.display(), error = %e, "could not set times");
    }
}

fn file_time(ns: i64) -> FileTime {
    FileTime::from_unix_time(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}
