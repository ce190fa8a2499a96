//! # Scanner
//!
//! Reconciles the cache with the live filesystem as a breadth-first
//! fixpoint. The first pass walks every known entry in insertion order,
//! comparing the cached `(mode, mtime_ns, size)` triple against a fresh
//! `lstat`; changed entries are dirtied and, for directories, their listing
//! is diffed against the cached children — new names become entries flagged
//! `new`, vanished names are deleted (cascading to their subtrees). The
//! second phase repeatedly scans whatever is flagged `new` until nothing is,
//! which is exactly a breadth-first descent into newly discovered
//! directories.
//!
//! The scanner is single-threaded and holds an immediate write transaction
//! per batch; it reads then writes, and must not lose the lock after doing
//! work.

use crate::cache::{Cache, FsEntry};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entries processed per write transaction.
const SCAN_BATCH: usize = 1000;

/// How often to force a WAL checkpoint during a long scan.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Scans all tracked entries for changes.
///
/// `progress` is called with `(scanned, Some(total))` during the pass over
/// existing entries and `(scanned, None)` while discovering new ones. With
/// `skip_existing` the first pass is skipped — used right after `addroot`
/// to scan only the newly added tree.
///
/// Returns the number of entries scanned.
pub fn scan(
    cache: &Cache,
    progress: &mut dyn FnMut(u64, Option<u64>),
    skip_existing: bool,
) -> Result<u64> {
    let mut scanned = 0u64;
    let mut next_checkpoint = Instant::now() + CHECKPOINT_INTERVAL;

    if !skip_existing {
        let total = cache.entry_count()?;
        let mut last_id = 0i64;
        loop {
            let batch = cache.entries_after(last_id, SCAN_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let tx = cache.immediate()?;
            for entry in batch {
                last_id = entry.id;
                scan_entry(cache, entry)?;
                scanned += 1;
                progress(scanned, Some(total));
            }
            tx.commit()?;
            maybe_checkpoint(cache, &mut next_checkpoint)?;
        }
    }

    // New-entry fixpoint: keep scanning whatever is flagged `new` until no
    // rows remain. Each round may discover more (children of new
    // directories), so this terminates only once the frontier is empty.
    loop {
        let batch = cache.new_entries(SCAN_BATCH)?;
        if batch.is_empty() {
            break;
        }
        let tx = cache.immediate()?;
        for entry in batch {
            let id = entry.id;
            scan_entry(cache, entry)?;
            scanned += 1;
            progress(scanned, None);

            // A scanned entry must either be gone or have its flag cleared,
            // or the loop above would select it forever.
            if let Some(e) = cache.entry(id)? {
                assert!(
                    !e.new,
                    "entry still flagged new after scan: {}",
                    e.printable_path()
                );
            }
        }
        tx.commit()?;
        maybe_checkpoint(cache, &mut next_checkpoint)?;
    }

    cache.analyze()?;
    Ok(scanned)
}

fn maybe_checkpoint(cache: &Cache, next: &mut Instant) -> Result<()> {
    if Instant::now() >= *next {
        cache.checkpoint()?;
        *next = Instant::now() + CHECKPOINT_INTERVAL;
    }
    Ok(())
}

/// Scans one entry for changes.
///
/// Performs an `lstat`; a vanished path deletes the entry (the cascade
/// removes any descendants). If the cached stat triple matches and the
/// entry is not new, nothing happens. Otherwise the entry is dirtied, its
/// stat is refreshed, directories have their listings reconciled, and
/// finally the entry's ancestors are invalidated so the change propagates
/// to the root.
pub fn scan_entry(cache: &Cache, mut entry: FsEntry) -> Result<()> {
    debug!(path = %entry.printable_path(), "scanning");

    // The batch that handed us this entry may have since deleted it via a
    // parent's cascade; a stale row must not be resurrected.
    if cache.entry(entry.id)?.is_none() {
        return Ok(());
    }

    let md = match fs::symlink_metadata(&entry.path) {
        Ok(md) => md,
        // NotADirectory happens when a parent component stopped being a
        // directory out from under us.
        Err(e) if e.kind() == ErrorKind::NotFound || is_not_a_directory(&e) => {
            info!(path = %entry.printable_path(), "not found, deleting");
            cache.delete_entry(entry.id)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mode = md.mode();
    let is_dir = mode & libc::S_IFMT == libc::S_IFDIR;

    if entry.was_dir() && !is_dir {
        // A directory was replaced by something else before we got to scan
        // it again; its recorded children are orphans now.
        info!(path = %entry.printable_path(), "no longer a directory");
        cache.delete_children(entry.id)?;
    }

    if !entry.new && entry.stat_matches(&md) {
        debug!(path = %entry.printable_path(), "unchanged");
        return Ok(());
    }

    entry.obj_id = None;
    entry.new = false;
    entry.update_stat(&md);

    if is_dir {
        let children = cache.children(entry.id)?;

        let (names, denied): (HashSet<OsString>, bool) = match fs::read_dir(&entry.path) {
            Ok(rd) => (
                rd.filter_map(|e| e.ok()).map(|e| e.file_name()).collect(),
                false,
            ),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // Treat as empty but keep the recorded children; they will
                // reappear on a later successful scan.
                warn!(path = %entry.printable_path(), "permission denied");
                (HashSet::new(), true)
            }
            Err(e) => return Err(e.into()),
        };

        let known: HashSet<OsString> =
            children.iter().map(|c| c.name().to_os_string()).collect();

        for name in names.iter().filter(|n| !known.contains(n.as_os_str())) {
            let child_path = entry.path.join(name);
            match cache.insert_entry(&child_path, Some(entry.id)) {
                Ok(_) => {
                    info!(path = %child_path.display(), "new path");
                }
                Err(Error::Cache(e)) if crate::cache::is_constraint_violation(&e) => {
                    // A root added later can be an ancestor of an existing
                    // root; re-discovering the old root merges the trees by
                    // re-parenting it. Anything else with this path already
                    // tracked means the tree is inconsistent.
                    let existing = cache.entry_by_path(&child_path)?.ok_or_else(|| {
                        Error::Config(format!(
                            "path vanished from the cache mid-scan: {}",
                            child_path.display()
                        ))
                    })?;
                    warn!(
                        path = %existing.printable_path(),
                        "path already tracked, re-parenting to merge trees"
                    );
                    assert!(
                        existing.parent_id.is_none(),
                        "re-parenting a non-root entry: {}",
                        existing.printable_path()
                    );
                    cache.reparent(existing.id, entry.id)?;
                }
                Err(e) => return Err(e),
            }
        }

        // Delete entries whose names are gone, except under a failed
        // readdir, where the recorded children must survive.
        if !denied {
            for child in children.iter().filter(|c| !names.contains(c.name())) {
                info!(path = %child.printable_path(), "gone from directory, deleting");
                cache.delete_entry(child.id)?;
            }
        }
    }

    info!(path = %entry.printable_path(), "entry updated");
    cache.save_entry(&entry)?;
    cache.invalidate_ancestors(entry.id)?;
    Ok(())
}

fn is_not_a_directory(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTDIR)
}
