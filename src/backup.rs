//! # Backup Pipeline
//!
//! Turns dirty filesystem entries into uploaded objects, in dependency
//! order. The selection is two queries over the cache: `to_backup` is every
//! entry with a null `obj_id`, and `ready` is the subset none of whose
//! children are dirty — the leaves of the dirty subgraph. Each outer
//! iteration drains the current ready set through a pool of workers, then
//! waits for all of them at a barrier before re-querying: entries selected
//! next round may depend on results still in flight this round.
//!
//! ## Per-entry generator
//!
//! Backing up one entry can take several objects, and later payloads need
//! the ids of earlier ones (a chunked file's inode references its blobs).
//! [`EntryBackup`] is that producer as an explicit state machine: each
//! [`EntryBackup::step`] yields a payload, and the caller feeds the saved
//! object back into the next step. Every exit path either records a
//! non-null `obj_id` on the entry or deletes the entry — leaving it null
//! would select it again forever.
//!
//! ## Workers
//!
//! Worker threads never share the driver's database connection: each opens
//! its own from a configuration snapshot captured at dispatcher start, and
//! keeps one `Repository` alive across batches to amortize setup. A
//! `--single` mode runs batches inline on the driver for debugging, with an
//! identical contract.

use crate::cache::{atime_ns, mtime_ns, Cache, FsEntry, ObjectRecord, Relation, SnapshotRecord};
use crate::chunker::FixedChunker;
use crate::codec::{self, Contents, FileInfo, TreeInfo};
use crate::crypto::ObjectId;
use crate::error::{Error, Result};
use crate::repo::{RepoConfig, Repository};
use crossbeam_channel::{Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entries handed to a worker per task.
const BATCH_SIZE: usize = 100;

/// How often the driver forces a WAL checkpoint.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

/// Options controlling a backup run.
#[derive(Default)]
pub struct BackupOptions {
    /// Run every batch inline on the calling thread (for debugging).
    pub single: bool,
    /// Cooperative interrupt: when set, the driver stops submitting new
    /// batches, lets in-flight work finish, and returns without writing
    /// snapshots. Entries not yet processed stay dirty for the next run.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Summary of a backup run.
#[derive(Debug)]
pub struct BackupStats {
    /// Entries processed (backed up or deleted).
    pub processed: u64,
    /// Dirty entries at the start of the run.
    pub total: u64,
    /// Snapshots written (one per root).
    pub snapshots: usize,
    /// True when the run was interrupted before completion.
    pub interrupted: bool,
}

/// Runs a backup: drains the dirty set through the worker pool, then writes
/// one snapshot per backup root, all sharing a single timestamp.
///
/// Fails with [`Error::ScanRequired`] if any entry is still flagged `new` —
/// a root was added but never scanned.
pub fn backup(
    repo: &Repository,
    progress: &mut dyn FnMut(u64, Option<u64>),
    opts: &BackupOptions,
) -> Result<BackupStats> {
    if repo.cache().has_new_entries()? {
        return Err(Error::ScanRequired);
    }

    let total = repo.cache().dirty_count()?;
    let cancel = opts
        .cancel
        .clone()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    // Immutable settings snapshot; workers build their own Repository (and
    // database connection) from this.
    let config = repo.config().clone();

    let mut done = 0u64;
    let completed = if opts.single {
        let worker = Worker::new(Repository::from_config(&config)?);
        let mut dispatcher = InlineDispatcher { worker };
        drive(repo.cache(), &mut dispatcher, progress, &mut done, total, &cancel)?
    } else {
        std::thread::scope(|scope| -> Result<bool> {
            let worker_count = num_cpus::get().max(1);
            let (job_tx, job_rx) = crossbeam_channel::bounded::<Vec<i64>>(worker_count);
            let (res_tx, res_rx) = crossbeam_channel::unbounded::<Result<u64>>();

            for _ in 0..worker_count {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let config = config.clone();
                scope.spawn(move || worker_loop(&config, &job_rx, &res_tx));
            }
            drop(job_rx);
            drop(res_tx);

            let mut dispatcher = PoolDispatcher {
                job_tx,
                res_rx,
                outstanding: 0,
                cap: worker_count + 1,
            };
            drive(repo.cache(), &mut dispatcher, progress, &mut done, total, &cancel)
        })?
    };

    if !completed {
        info!(
            processed = done,
            total, "backup interrupted; remaining entries stay dirty for the next run"
        );
        return Ok(BackupStats {
            processed: done,
            total,
            snapshots: 0,
            interrupted: true,
        });
    }

    // One snapshot per root, all sharing this run's timestamp so they can be
    // grouped in queries. Snapshot writes happen strictly after all entry
    // writes.
    let now = chrono::Utc::now().timestamp();
    let mut snapshots = 0;
    for root in repo.cache().roots()? {
        let objid = root.obj_id.unwrap_or_else(|| {
            panic!(
                "root has no object after a complete backup: {}",
                root.printable_path()
            )
        });
        let tx = repo.cache().immediate()?;
        let id = repo.cache().insert_snapshot(&root.path, &objid, now)?;
        repo.put_snapshot(&SnapshotRecord {
            id,
            path: root.path.clone(),
            root_id: objid,
            date: now,
        })?;
        tx.commit()?;
        snapshots += 1;
    }

    repo.cache().analyze()?;
    Ok(BackupStats {
        processed: done,
        total,
        snapshots,
        interrupted: false,
    })
}

// ─── Driver ─────────────────────────────────────────────────────────────────

trait Dispatch {
    /// Hands a batch of entry ids to a worker. Returns the per-batch counts
    /// of any work that completed while submitting.
    fn submit(&mut self, ids: Vec<i64>) -> Result<Vec<u64>>;

    /// Waits for every outstanding batch. This is the per-iteration barrier.
    fn drain(&mut self) -> Result<Vec<u64>>;
}

struct InlineDispatcher {
    worker: Worker,
}

impl Dispatch for InlineDispatcher {
    fn submit(&mut self, ids: Vec<i64>) -> Result<Vec<u64>> {
        Ok(vec![self.worker.run_batch(&ids)?])
    }

    fn drain(&mut self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }
}

struct PoolDispatcher {
    job_tx: Sender<Vec<i64>>,
    res_rx: Receiver<Result<u64>>,
    outstanding: usize,
    cap: usize,
}

impl PoolDispatcher {
    fn recv_one(&mut self) -> Result<u64> {
        let res = self
            .res_rx
            .recv()
            .map_err(|_| Error::Config("worker pool disconnected unexpectedly".into()))?;
        self.outstanding -= 1;
        res
    }
}

impl Dispatch for PoolDispatcher {
    fn submit(&mut self, ids: Vec<i64>) -> Result<Vec<u64>> {
        self.job_tx
            .send(ids)
            .map_err(|_| Error::Config("worker pool shut down unexpectedly".into()))?;
        self.outstanding += 1;

        // Keep the whole ready set out of the queue at once; when enough
        // tasks are in flight, wait for one to finish before submitting more.
        let mut counts = Vec::new();
        if self.outstanding > self.cap {
            counts.push(self.recv_one()?);
        }
        Ok(counts)
    }

    fn drain(&mut self) -> Result<Vec<u64>> {
        let mut counts = Vec::new();
        while self.outstanding > 0 {
            counts.push(self.recv_one()?);
        }
        Ok(counts)
    }
}

fn worker_loop(config: &RepoConfig, jobs: &Receiver<Vec<i64>>, results: &Sender<Result<u64>>) {
    let worker = match Repository::from_config(config).map(Worker::new) {
        Ok(worker) => worker,
        Err(e) => {
            let msg = format!("worker failed to open the repository: {e}");
            for _ in jobs.iter() {
                let _ = results.send(Err(Error::Config(msg.clone())));
            }
            return;
        }
    };
    for ids in jobs.iter() {
        let _ = results.send(worker.run_batch(&ids));
    }
}

fn drive(
    cache: &Cache,
    dispatcher: &mut dyn Dispatch,
    progress: &mut dyn FnMut(u64, Option<u64>),
    done: &mut u64,
    total: u64,
    cancel: &AtomicBool,
) -> Result<bool> {
    let mut next_checkpoint = Instant::now() + CHECKPOINT_INTERVAL;

    while cache.dirty_count()? > 0 {
        if cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let mut submitted = false;
        let mut last_id = 0i64;
        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let batch = cache.ready_entries(last_id, BATCH_SIZE)?;
            let Some(last) = batch.last() else { break };
            last_id = last.id;
            submitted = true;

            let ids = batch.iter().map(|e| e.id).collect();
            for n in dispatcher.submit(ids)? {
                *done += n;
                progress(*done, Some(total));
            }

            // The checkpoint cannot run while a long cursor holds a read
            // lock, so it goes between the short keyset batches.
            if Instant::now() >= next_checkpoint {
                cache.checkpoint()?;
                next_checkpoint = Instant::now() + CHECKPOINT_INTERVAL;
            }
        }

        // Barrier: everything selected next iteration may depend on results
        // still in flight from this one.
        for n in dispatcher.drain()? {
            *done += n;
            progress(*done, Some(total));
        }

        if cancel.load(Ordering::SeqCst) {
            info!("interrupt received, finished in-flight uploads");
            return Ok(false);
        }

        // If entries need backing up but none were ready, we are not making
        // progress. Only a cycle in the entry tree can cause this.
        assert!(
            submitted,
            "dirty entries remain but none are ready to back up; cycle in the entry tree?"
        );
    }

    Ok(true)
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// One backup worker; owns its own `Repository` (and database connection)
/// for its whole lifetime.
struct Worker {
    repo: Repository,
}

impl Worker {
    fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn run_batch(&self, ids: &[i64]) -> Result<u64> {
        for &id in ids {
            // The row may have been removed (or completed) since selection;
            // batches tolerate stale observations.
            let Some(entry) = self.repo.cache().entry(id)? else {
                continue;
            };
            if entry.obj_id.is_some() {
                continue;
            }
            self.backup_entry(entry)?;
        }
        Ok(ids.len() as u64)
    }

    fn backup_entry(&self, entry: FsEntry) -> Result<()> {
        let mut producer = EntryBackup::new(entry, self.repo.inline_threshold());
        let mut reply = None;
        loop {
            match producer.step(self.repo.cache(), reply.take())? {
                Step::Payload { payload, relations } => {
                    reply = Some(self.repo.push_object(&payload, &relations)?);
                }
                Step::Done | Step::Deleted => return Ok(()),
            }
        }
    }
}

// ─── Per-entry generator ────────────────────────────────────────────────────

/// What a generator step produced.
pub(crate) enum Step {
    /// A payload to push; the saved object must be fed into the next step.
    Payload {
        payload: Vec<u8>,
        relations: Vec<Relation>,
    },
    /// The entry's `obj_id` has been recorded; nothing more to do.
    Done,
    /// The entry was deleted instead of backed up.
    Deleted,
}

/// Cooperative backup producer for a single entry.
///
/// Emits payloads strictly child-first: for a chunked file, each blob then
/// the inode referencing them; for a directory, one tree payload after
/// checking every child already has an object (a dirty child here is a
/// driver ordering bug and fatal).
pub(crate) struct EntryBackup {
    entry: FsEntry,
    inline_threshold: u64,
    phase: Phase,
}

enum Phase {
    Start,
    Chunking {
        chunker: FixedChunker<File>,
        info: FileInfo,
        pending_offset: u64,
        chunks: Vec<(u64, ObjectId)>,
        relations: Vec<Relation>,
    },
    Finish,
}

impl EntryBackup {
    pub(crate) fn new(entry: FsEntry, inline_threshold: u64) -> Self {
        Self {
            entry,
            inline_threshold,
            phase: Phase::Start,
        }
    }

    /// Advances the generator. `reply` carries the object saved for the
    /// previously yielded payload, if any.
    pub(crate) fn step(&mut self, cache: &Cache, reply: Option<ObjectRecord>) -> Result<Step> {
        match std::mem::replace(&mut self.phase, Phase::Start) {
            Phase::Start => {
                let md = match fs::symlink_metadata(&self.entry.path) {
                    Ok(md) => md,
                    Err(e)
                        if e.kind() == ErrorKind::NotFound
                            || e.raw_os_error() == Some(libc::ENOTDIR) =>
                    {
                        info!(path = %self.entry.printable_path(), "file disappeared");
                        cache.delete_entry(self.entry.id)?;
                        return Ok(Step::Deleted);
                    }
                    Err(e) => return Err(e.into()),
                };
                self.entry.update_stat(&md);

                let kind = md.mode() & libc::S_IFMT;
                if kind == libc::S_IFREG {
                    self.start_file(cache, &md)
                } else if kind == libc::S_IFDIR {
                    self.start_dir(cache, &md)
                } else {
                    warn!(
                        path = %self.entry.printable_path(),
                        "unknown file type, not backing up"
                    );
                    cache.delete_entry(self.entry.id)?;
                    Ok(Step::Deleted)
                }
            }

            Phase::Chunking {
                mut chunker,
                info,
                pending_offset,
                mut chunks,
                mut relations,
            } => {
                let obj = reply.expect("driver must send the saved object after each payload");
                chunks.push((pending_offset, obj.objid));
                relations.push(Relation {
                    child: obj.objid,
                    name: None,
                });

                match chunker.next() {
                    Some(Ok((pos, data))) => {
                        let payload = codec::encode_blob(&data)?;
                        self.phase = Phase::Chunking {
                            chunker,
                            info,
                            pending_offset: pos,
                            chunks,
                            relations,
                        };
                        Ok(Step::Payload {
                            payload,
                            relations: Vec::new(),
                        })
                    }
                    Some(Err(e)) => {
                        // Already-uploaded chunks become unreferenced and are
                        // reclaimed by a later GC pass; there is no rollback.
                        warn!(
                            path = %self.entry.printable_path(),
                            error = %e,
                            "read failed mid-backup, deleting entry"
                        );
                        cache.delete_entry(self.entry.id)?;
                        Ok(Step::Deleted)
                    }
                    None => {
                        let payload = codec::encode_inode(&info, &Contents::ChunkList(chunks))?;
                        self.phase = Phase::Finish;
                        Ok(Step::Payload { payload, relations })
                    }
                }
            }

            Phase::Finish => {
                let obj = reply.expect("driver must send the saved object after each payload");
                self.entry.obj_id = Some(obj.objid);
                self.entry.new = false;
                cache.save_entry(&self.entry)?;
                debug!(path = %self.entry.printable_path(), objid = %obj.objid.short(), "entry backed up");
                Ok(Step::Done)
            }
        }
    }

    fn start_file(&mut self, cache: &Cache, md: &fs::Metadata) -> Result<Step> {
        let info = FileInfo {
            size: md.size(),
            inode: md.ino(),
            uid: md.uid(),
            gid: md.gid(),
            mode: md.mode(),
            mtime_ns: mtime_ns(md),
            atime_ns: atime_ns(md),
        };

        let mut file = match open_noatime(&self.entry.path) {
            Ok(file) => file,
            Err(e) => {
                // Vanished or unreadable either way: the entry must go so
                // the parent directory can still be backed up.
                warn!(
                    path = %self.entry.printable_path(),
                    error = %e,
                    "cannot open file, deleting entry"
                );
                cache.delete_entry(self.entry.id)?;
                return Ok(Step::Deleted);
            }
        };

        if info.size < self.inline_threshold {
            let mut contents = Vec::with_capacity(info.size as usize);
            if let Err(e) = file.read_to_end(&mut contents) {
                warn!(
                    path = %self.entry.printable_path(),
                    error = %e,
                    "read failed, deleting entry"
                );
                cache.delete_entry(self.entry.id)?;
                return Ok(Step::Deleted);
            }
            let payload = codec::encode_inode(&info, &Contents::Immediate(contents))?;
            self.phase = Phase::Finish;
            return Ok(Step::Payload {
                payload,
                relations: Vec::new(),
            });
        }

        let mut chunker = FixedChunker::new(file);
        match chunker.next() {
            Some(Ok((pos, data))) => {
                let payload = codec::encode_blob(&data)?;
                self.phase = Phase::Chunking {
                    chunker,
                    info,
                    pending_offset: pos,
                    chunks: Vec::new(),
                    relations: Vec::new(),
                };
                Ok(Step::Payload {
                    payload,
                    relations: Vec::new(),
                })
            }
            Some(Err(e)) => {
                warn!(
                    path = %self.entry.printable_path(),
                    error = %e,
                    "read failed, deleting entry"
                );
                cache.delete_entry(self.entry.id)?;
                Ok(Step::Deleted)
            }
            None => {
                // The file shrank to nothing between lstat and open.
                let payload = codec::encode_inode(&info, &Contents::ChunkList(Vec::new()))?;
                self.phase = Phase::Finish;
                Ok(Step::Payload {
                    payload,
                    relations: Vec::new(),
                })
            }
        }
    }

    fn start_dir(&mut self, cache: &Cache, md: &fs::Metadata) -> Result<Step> {
        // Backing up a directory reads nothing from the filesystem beyond
        // the lstat; everything needed is already in the cache.
        let children = cache.children(self.entry.id)?;

        let dirty: Vec<String> = children
            .iter()
            .filter(|c| c.obj_id.is_none())
            .map(|c| c.printable_path())
            .collect();
        assert!(
            dirty.is_empty(),
            "{} depends on paths that have not been backed up yet: {}",
            self.entry.printable_path(),
            dirty.join(", ")
        );

        let info = TreeInfo {
            uid: md.uid(),
            gid: md.gid(),
            mode: md.mode(),
            mtime_ns: mtime_ns(md),
            atime_ns: atime_ns(md),
        };

        let mut entries = Vec::with_capacity(children.len());
        let mut relations = Vec::with_capacity(children.len());
        for child in &children {
            let Some(objid) = child.obj_id else {
                unreachable!()
            };
            // The payload carries the original name bytes; the relation
            // carries a best-effort UTF-8 decoding for search and listing.
            entries.push((child.name().as_bytes().to_vec(), objid));
            relations.push(Relation {
                child: objid,
                name: Some(utf8_ignore(child.name().as_bytes())),
            });
        }

        let payload = codec::encode_tree(&info, &entries)?;
        self.phase = Phase::Finish;
        Ok(Step::Payload { payload, relations })
    }
}

/// Opens a file read-only without disturbing its atime where permitted
/// (`O_NOATIME` is restricted to the file's owner).
fn open_noatime(path: &std::path::Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOATIME)
        .open(path)
    {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            OpenOptions::new().read(true).open(path)
        }
        other => other,
    }
}

/// Decodes bytes as UTF-8, dropping invalid sequences, for the indexed
/// relation `name` column.
fn utf8_ignore(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                if let Ok(s) = std::str::from_utf8(valid) {
                    out.push_str(s);
                }
                match e.error_len() {
                    Some(n) => rest = &after[n..],
                    None => break,
                }
            }
        }
    }
    out
}
