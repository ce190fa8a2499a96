//! # Metadata Cache
//!
//! A transactional SQLite store of filesystem entries, known repository
//! objects, their dependency graph, snapshots, and persisted settings. The
//! cache is the authoritative record of what has been uploaded: an object
//! row exists only once its payload is durably stored remotely, and an
//! `fsentry` row with a null `obj_id` is by definition dirty and will be
//! selected by the next backup.
//!
//! ## Transactions
//!
//! Scan and backup read the database and then write based on what they saw,
//! so they must never lose the write lock mid-transaction. [`Cache::immediate`]
//! opens a `BEGIN IMMEDIATE` transaction, taking the reserved lock up front
//! instead of on first write. Long iterations go through short
//! keyset-paginated batches (`id > ? ORDER BY id LIMIT n`) so no streaming
//! cursor pins the write-ahead log, and [`Cache::checkpoint`] is called on a
//! cadence to keep the log bounded. Callers must still tolerate rows being
//! skipped or re-observed between batches.
//!
//! ## Cascades
//!
//! `fsentry.parent_id` cascades deletes in the engine, so removing a
//! directory entry removes its whole subtree without loading it into memory.
//! Deleting an object (GC) nulls out any `fsentry.obj_id` pointing at it,
//! which marks those entries dirty again.

use crate::crypto::ObjectId;
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsStr;
use std::fs::Metadata;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    objid               BLOB PRIMARY KEY,
    type                TEXT,
    payload             BLOB,
    uploaded_size       INTEGER,
    file_size           INTEGER,
    last_modified_time  INTEGER
);

CREATE TABLE IF NOT EXISTS object_relations (
    parent_id  BLOB NOT NULL REFERENCES objects (objid) ON DELETE CASCADE,
    child_id   BLOB NOT NULL REFERENCES objects (objid) ON DELETE CASCADE,
    name       TEXT,
    PRIMARY KEY (parent_id, child_id)
);
CREATE INDEX IF NOT EXISTS object_relations_child ON object_relations (child_id);

CREATE TABLE IF NOT EXISTS fsentry (
    id           INTEGER PRIMARY KEY,
    path         BLOB NOT NULL UNIQUE,
    parent_id    INTEGER REFERENCES fsentry (id) ON DELETE CASCADE,
    obj_id       BLOB REFERENCES objects (objid) ON DELETE SET NULL,
    new          INTEGER NOT NULL DEFAULT 1,
    st_mode      INTEGER,
    st_mtime_ns  INTEGER,
    st_size      INTEGER
);
CREATE INDEX IF NOT EXISTS fsentry_parent ON fsentry (parent_id);
CREATE INDEX IF NOT EXISTS fsentry_new ON fsentry (new);
CREATE INDEX IF NOT EXISTS fsentry_obj ON fsentry (obj_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id       INTEGER PRIMARY KEY,
    path     BLOB NOT NULL,
    root_id  BLOB NOT NULL REFERENCES objects (objid),
    date     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS snapshots_date ON snapshots (date);

CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

/// One filesystem path tracked under a backup root.
#[derive(Debug, Clone)]
pub struct FsEntry {
    pub id: i64,
    pub path: PathBuf,
    pub parent_id: Option<i64>,
    pub obj_id: Option<ObjectId>,
    pub new: bool,
    pub st_mode: Option<u32>,
    pub st_mtime_ns: Option<i64>,
    pub st_size: Option<u64>,
}

impl FsEntry {
    /// Final path component, as raw OS bytes.
    pub fn name(&self) -> &OsStr {
        self.path.file_name().unwrap_or(self.path.as_os_str())
    }

    /// Lossy rendering for log lines; the real path may not be valid UTF-8.
    pub fn printable_path(&self) -> String {
        String::from_utf8_lossy(self.path.as_os_str().as_bytes()).into_owned()
    }

    /// Whether the last recorded stat said this was a directory.
    pub fn was_dir(&self) -> bool {
        self.st_mode
            .is_some_and(|m| m & libc::S_IFMT == libc::S_IFDIR)
    }

    pub fn update_stat(&mut self, md: &Metadata) {
        self.st_mode = Some(md.mode());
        self.st_mtime_ns = Some(mtime_ns(md));
        self.st_size = Some(md.size());
    }

    /// True when `(mode, mtime_ns, size)` all match the cached triple.
    pub fn stat_matches(&self, md: &Metadata) -> bool {
        self.st_mode == Some(md.mode())
            && self.st_mtime_ns == Some(mtime_ns(md))
            && self.st_size == Some(md.size())
    }
}

/// Whole-file modification time in nanoseconds since the epoch.
pub fn mtime_ns(md: &Metadata) -> i64 {
    md.mtime() * 1_000_000_000 + md.mtime_nsec()
}

/// Whole-file access time in nanoseconds since the epoch.
pub fn atime_ns(md: &Metadata) -> i64 {
    md.atime() * 1_000_000_000 + md.atime_nsec()
}

/// A content-addressed object known to exist in the remote repository.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub objid: ObjectId,
    /// Object type tag ("blob", "inode", "tree", "snapshot").
    pub kind: Option<String>,
    /// Plaintext payload, cached locally for inode and tree objects only.
    pub payload: Option<Vec<u8>>,
    /// Size of the framed (compressed + encrypted) upload.
    pub uploaded_size: Option<u64>,
    /// For inode objects, the file's size.
    pub file_size: Option<u64>,
    /// For inode and tree objects, the entry's mtime in unix seconds.
    pub last_modified_time: Option<i64>,
}

/// A parent → child edge recorded when an object is pushed.
#[derive(Debug, Clone)]
pub struct Relation {
    pub child: ObjectId,
    /// Best-effort UTF-8 decoding of the directory entry name (tree parents
    /// only); the exact raw name lives in the payload.
    pub name: Option<String>,
}

/// A point-in-time root; the set of snapshots is the GC root set.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: i64,
    pub path: PathBuf,
    pub root_id: ObjectId,
    pub date: i64,
}

/// Handle to the cache database. One connection per holder; worker threads
/// open their own.
pub struct Cache {
    conn: Connection,
}

impl Cache {
    /// Opens (creating if needed) the cache at `path` and applies the
    /// connection tunings: WAL journaling, enforced foreign keys, and a
    /// busy timeout generous enough to ride out a peer's in-transaction
    /// upload.
    pub fn open(path: &Path) -> Result<Cache> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(60))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Cache { conn })
    }

    /// Begins a write transaction that takes the reserved lock immediately.
    ///
    /// Rolls back on drop unless [`ImmediateGuard::commit`] is called.
    pub fn immediate(&self) -> Result<ImmediateGuard<'_>> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(ImmediateGuard {
            conn: &self.conn,
            done: false,
        })
    }

    /// Forces a write-ahead-log checkpoint. Scan and backup call this every
    /// ~30 s between batches; without it the log grows for the duration of
    /// the run.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(RESTART)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Refreshes the query planner statistics.
    pub fn analyze(&self) -> Result<()> {
        self.conn.execute_batch("ANALYZE")?;
        Ok(())
    }

    /// Compacts the database file. Run after GC deletes rows.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Config(format!("setting {key:?} is unreadable: {e}"))),
        }
    }

    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::Config(format!("setting {key:?} is unserializable: {e}")))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;
        Ok(())
    }

    // ─── Filesystem entries ─────────────────────────────────────────────────

    pub fn entry_count(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM fsentry", [], |r| r.get(0))?)
    }

    pub fn entry(&self, id: i64) -> Result<Option<FsEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
                 FROM fsentry WHERE id = ?1",
                [id],
                entry_from_row,
            )
            .optional()?)
    }

    pub fn entry_by_path(&self, path: &Path) -> Result<Option<FsEntry>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
                 FROM fsentry WHERE path = ?1",
                [path.as_os_str().as_bytes()],
                entry_from_row,
            )
            .optional()?)
    }

    /// Entries in insertion order, starting strictly after `after`.
    pub fn entries_after(&self, after: i64, limit: usize) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
             FROM fsentry WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// A batch of entries still flagged `new`, in insertion order.
    pub fn new_entries(&self, limit: usize) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
             FROM fsentry WHERE new != 0 ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn has_new_entries(&self) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM fsentry WHERE new != 0)",
            [],
            |r| r.get(0),
        )?)
    }

    /// Children of an entry, ordered by path so sibling order is stable.
    pub fn children(&self, id: i64) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
             FROM fsentry WHERE parent_id = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map([id], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Backup roots: entries with no parent, in insertion order.
    pub fn roots(&self) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
             FROM fsentry WHERE parent_id IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Inserts a fresh entry (flagged `new`). Fails with a constraint error
    /// if the path is already tracked; scan uses that to detect tree merges.
    pub fn insert_entry(&self, path: &Path, parent_id: Option<i64>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO fsentry (path, parent_id, new) VALUES (?1, ?2, 1)",
            params![path.as_os_str().as_bytes(), parent_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Registers a new backup root.
    pub fn add_root(&self, path: &Path) -> Result<i64> {
        match self.insert_entry(path, None) {
            Ok(id) => Ok(id),
            Err(Error::Cache(e)) if is_constraint_violation(&e) => Err(Error::Config(format!(
                "path is already being backed up: {}",
                path.display()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Removes a backup root (and, via cascade, everything under it).
    /// Returns false if the path is not a root.
    pub fn remove_root(&self, path: &Path) -> Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM fsentry WHERE path = ?1 AND parent_id IS NULL",
            params![path.as_os_str().as_bytes()],
        )?;
        Ok(n > 0)
    }

    /// Moves an existing entry under a new parent. Used when a freshly added
    /// root turns out to contain a previously registered root.
    pub fn reparent(&self, id: i64, parent_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE fsentry SET parent_id = ?2 WHERE id = ?1",
            params![id, parent_id],
        )?;
        Ok(())
    }

    /// Deletes an entry; the engine cascades to all descendants.
    pub fn delete_entry(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM fsentry WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Deletes all children of an entry (used when a directory stops being a
    /// directory).
    pub fn delete_children(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM fsentry WHERE parent_id = ?1", [id])?;
        Ok(())
    }

    /// Persists the mutable fields of an entry.
    pub fn save_entry(&self, entry: &FsEntry) -> Result<()> {
        self.conn.execute(
            "UPDATE fsentry
             SET obj_id = ?2, new = ?3, st_mode = ?4, st_mtime_ns = ?5, st_size = ?6
             WHERE id = ?1",
            params![
                entry.id,
                entry.obj_id.as_ref().map(|o| o.as_bytes()),
                entry.new,
                entry.st_mode,
                entry.st_mtime_ns,
                entry.st_size.map(|s| s as i64),
            ],
        )?;
        Ok(())
    }

    /// Clears `obj_id` on an entry and every ancestor up to its root, in a
    /// single recursive statement, so a change deep in the tree dirties the
    /// whole path above it.
    pub fn invalidate_ancestors(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "WITH RECURSIVE ancestors (id) AS (
                 SELECT id FROM fsentry WHERE id = ?1
                 UNION ALL
                 SELECT fsentry.parent_id FROM fsentry
                 INNER JOIN ancestors ON fsentry.id = ancestors.id
                 WHERE fsentry.parent_id IS NOT NULL
             )
             UPDATE fsentry SET obj_id = NULL WHERE id IN ancestors",
            [id],
        )?;
        Ok(())
    }

    /// Number of entries still needing backup.
    pub fn dirty_count(&self) -> Result<u64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM fsentry WHERE obj_id IS NULL",
            [],
            |r| r.get(0),
        )?)
    }

    /// A batch of the ready set: dirty entries none of whose children are
    /// dirty, starting strictly after `after`.
    pub fn ready_entries(&self, after: i64, limit: usize) -> Result<Vec<FsEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, parent_id, obj_id, new, st_mode, st_mtime_ns, st_size
             FROM fsentry
             WHERE obj_id IS NULL
               AND id > ?1
               AND id NOT IN (
                   SELECT parent_id FROM fsentry
                   WHERE obj_id IS NULL AND parent_id IS NOT NULL
               )
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], entry_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ─── Objects ────────────────────────────────────────────────────────────

    pub fn object_count(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))?)
    }

    pub fn object(&self, objid: &[u8]) -> Result<Option<ObjectRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT objid, type, payload, uploaded_size, file_size, last_modified_time
                 FROM objects WHERE objid = ?1",
                [objid],
                object_from_row,
            )
            .optional()?)
    }

    pub fn object_exists(&self, objid: &[u8]) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM objects WHERE objid = ?1)",
            [objid],
            |r| r.get(0),
        )?)
    }

    pub fn insert_object(&self, rec: &ObjectRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO objects (objid, type, payload, uploaded_size, file_size, last_modified_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.objid.as_bytes(),
                rec.kind,
                rec.payload,
                rec.uploaded_size.map(|s| s as i64),
                rec.file_size.map(|s| s as i64),
                rec.last_modified_time,
            ],
        )?;
        Ok(())
    }

    /// Records parent → child edges, deduplicating repeated children (a file
    /// hard-linked twice in one directory, identical chunks in one file).
    pub fn insert_relations(&self, parent: &ObjectId, relations: &[Relation]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO object_relations (parent_id, child_id, name)
             VALUES (?1, ?2, ?3)",
        )?;
        for rel in relations {
            stmt.execute(params![
                parent.as_bytes(),
                rel.child.as_bytes(),
                rel.name
            ])?;
        }
        Ok(())
    }

    /// The recorded children of an object.
    pub fn object_children(&self, objid: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT child_id FROM object_relations WHERE parent_id = ?1")?;
        let rows = stmt.query_map([objid], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// A keyset page over all objects: `(objid, uploaded_size)` pairs with
    /// `objid` strictly greater than `after` in blob order.
    pub fn objects_page(
        &self,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Option<u64>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT objid, uploaded_size FROM objects
             WHERE (?1 IS NULL OR objid > ?1)
             ORDER BY objid LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after, limit as i64], |r| {
            Ok((
                r.get::<_, Vec<u8>>(0)?,
                r.get::<_, Option<i64>>(1)?.map(|s| s as u64),
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_object(&self, objid: &[u8]) -> Result<()> {
        self.conn
            .execute("DELETE FROM objects WHERE objid = ?1", [objid])?;
        Ok(())
    }

    /// Walks every object reachable from any snapshot root, invoking `f`
    /// with each raw objid (roots included, repeats possible for shared
    /// subtrees).
    pub fn for_each_reachable(&self, mut f: impl FnMut(&[u8])) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE reachable (id) AS (
                 SELECT root_id FROM snapshots
                 UNION ALL
                 SELECT child_id FROM object_relations
                 INNER JOIN reachable ON reachable.id = parent_id
             ) SELECT id FROM reachable",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, Vec<u8>>(0))?;
        for row in rows {
            f(&row?);
        }
        Ok(())
    }

    // ─── Snapshots ──────────────────────────────────────────────────────────

    pub fn insert_snapshot(&self, path: &Path, root: &ObjectId, date: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO snapshots (path, root_id, date) VALUES (?1, ?2, ?3)",
            params![path.as_os_str().as_bytes(), root.as_bytes(), date],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, root_id, date FROM snapshots ORDER BY date, id")?;
        let rows = stmt.query_map([], snapshot_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, root_id, date FROM snapshots WHERE id = ?1",
                [id],
                snapshot_from_row,
            )
            .optional()?)
    }

    /// Deletes a snapshot, making its unique descendants GC candidates.
    pub fn delete_snapshot(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM snapshots WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

/// An open `BEGIN IMMEDIATE` transaction; rolls back on drop.
pub struct ImmediateGuard<'c> {
    conn: &'c Connection,
    done: bool,
}

impl ImmediateGuard<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ImmediateGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<FsEntry> {
    let path: Vec<u8> = row.get(1)?;
    let obj: Option<Vec<u8>> = row.get(3)?;
    let obj_id = obj
        .map(|b| ObjectId::try_from(b.as_slice()))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Blob, Box::new(e))
        })?;
    Ok(FsEntry {
        id: row.get(0)?,
        path: PathBuf::from(std::ffi::OsString::from_vec(path)),
        parent_id: row.get(2)?,
        obj_id,
        new: row.get(4)?,
        st_mode: row.get(5)?,
        st_mtime_ns: row.get(6)?,
        st_size: row.get::<_, Option<i64>>(7)?.map(|s| s as u64),
    })
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let objid: Vec<u8> = row.get(0)?;
    let objid = ObjectId::try_from(objid.as_slice()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    Ok(ObjectRecord {
        objid,
        kind: row.get(1)?,
        payload: row.get(2)?,
        uploaded_size: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
        file_size: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
        last_modified_time: row.get(5)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    let path: Vec<u8> = row.get(1)?;
    let root: Vec<u8> = row.get(2)?;
    let root_id = ObjectId::try_from(root.as_slice()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    Ok(SnapshotRecord {
        id: row.get(0)?,
        path: PathBuf::from(std::ffi::OsString::from_vec(path)),
        root_id,
        date: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cache() -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&dir.path().join("cache.db")).unwrap();
        (dir, cache)
    }

    fn oid(seed: u8) -> ObjectId {
        ObjectId::from_bytes([seed; 32])
    }

    fn insert_obj(cache: &Cache, seed: u8) -> ObjectId {
        let id = oid(seed);
        cache
            .insert_object(&ObjectRecord {
                objid: id,
                kind: Some("blob".into()),
                payload: None,
                uploaded_size: Some(10),
                file_size: None,
                last_modified_time: None,
            })
            .unwrap();
        id
    }

    #[test]
    fn parent_delete_cascades() {
        let (_dir, cache) = open_cache();
        let root = cache.insert_entry(Path::new("/a"), None).unwrap();
        let dir = cache.insert_entry(Path::new("/a/b"), Some(root)).unwrap();
        let _file = cache.insert_entry(Path::new("/a/b/c"), Some(dir)).unwrap();

        cache.delete_entry(root).unwrap();
        assert_eq!(cache.entry_count().unwrap(), 0);
    }

    #[test]
    fn invalidate_clears_obj_up_to_root() {
        let (_dir, cache) = open_cache();
        let o = insert_obj(&cache, 1);

        let root = cache.insert_entry(Path::new("/a"), None).unwrap();
        let mid = cache.insert_entry(Path::new("/a/b"), Some(root)).unwrap();
        let leaf = cache.insert_entry(Path::new("/a/b/c"), Some(mid)).unwrap();
        let other = cache.insert_entry(Path::new("/a/d"), Some(root)).unwrap();

        for id in [root, mid, leaf, other] {
            let mut e = cache.entry(id).unwrap().unwrap();
            e.obj_id = Some(o);
            e.new = false;
            cache.save_entry(&e).unwrap();
        }

        cache.invalidate_ancestors(leaf).unwrap();

        assert!(cache.entry(leaf).unwrap().unwrap().obj_id.is_none());
        assert!(cache.entry(mid).unwrap().unwrap().obj_id.is_none());
        assert!(cache.entry(root).unwrap().unwrap().obj_id.is_none());
        // Siblings are untouched
        assert!(cache.entry(other).unwrap().unwrap().obj_id.is_some());
    }

    #[test]
    fn ready_set_is_leaves_of_dirty_subgraph() {
        let (_dir, cache) = open_cache();
        let o = insert_obj(&cache, 1);

        let root = cache.insert_entry(Path::new("/a"), None).unwrap();
        let dir = cache.insert_entry(Path::new("/a/b"), Some(root)).unwrap();
        let file = cache.insert_entry(Path::new("/a/b/c"), Some(dir)).unwrap();

        // Everything dirty: only the leaf is ready.
        let ready = cache.ready_entries(0, 100).unwrap();
        assert_eq!(
            ready.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![file]
        );

        // Mark the leaf done: now the directory becomes ready.
        let mut e = cache.entry(file).unwrap().unwrap();
        e.obj_id = Some(o);
        cache.save_entry(&e).unwrap();

        let ready = cache.ready_entries(0, 100).unwrap();
        assert_eq!(ready.iter().map(|e| e.id).collect::<Vec<_>>(), vec![dir]);
    }

    #[test]
    fn deleting_object_marks_entries_dirty() {
        let (_dir, cache) = open_cache();
        let o = insert_obj(&cache, 2);

        let root = cache.insert_entry(Path::new("/a"), None).unwrap();
        let mut e = cache.entry(root).unwrap().unwrap();
        e.obj_id = Some(o);
        cache.save_entry(&e).unwrap();

        cache.delete_object(o.as_bytes()).unwrap();
        assert!(cache.entry(root).unwrap().unwrap().obj_id.is_none());
    }

    #[test]
    fn duplicate_path_is_a_constraint_violation() {
        let (_dir, cache) = open_cache();
        cache.insert_entry(Path::new("/a"), None).unwrap();
        match cache.insert_entry(Path::new("/a"), None) {
            Err(Error::Cache(e)) => assert!(is_constraint_violation(&e)),
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn add_root_reports_duplicates() {
        let (_dir, cache) = open_cache();
        cache.add_root(Path::new("/a")).unwrap();
        assert!(matches!(
            cache.add_root(Path::new("/a")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn relations_deduplicate_children() {
        let (_dir, cache) = open_cache();
        let parent = insert_obj(&cache, 1);
        let child = insert_obj(&cache, 2);

        cache
            .insert_relations(
                &parent,
                &[
                    Relation {
                        child,
                        name: Some("one".into()),
                    },
                    Relation {
                        child,
                        name: Some("two".into()),
                    },
                ],
            )
            .unwrap();

        assert_eq!(cache.object_children(parent.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn reachability_walks_shared_subtrees() {
        let (_dir, cache) = open_cache();
        let a = insert_obj(&cache, 1);
        let b = insert_obj(&cache, 2);
        let c = insert_obj(&cache, 3);
        let _orphan = insert_obj(&cache, 4);

        cache
            .insert_relations(&a, &[Relation { child: b, name: None }])
            .unwrap();
        cache
            .insert_relations(&b, &[Relation { child: c, name: None }])
            .unwrap();
        cache.insert_snapshot(Path::new("/a"), &a, 0).unwrap();

        let mut seen = Vec::new();
        cache.for_each_reachable(|id| seen.push(id.to_vec())).unwrap();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&oid(4).as_bytes().to_vec()));
    }

    #[test]
    fn immediate_guard_rolls_back_on_drop() {
        let (_dir, cache) = open_cache();
        {
            let _tx = cache.immediate().unwrap();
            cache.insert_entry(Path::new("/a"), None).unwrap();
            // dropped without commit
        }
        assert_eq!(cache.entry_count().unwrap(), 0);

        let tx = cache.immediate().unwrap();
        cache.insert_entry(Path::new("/a"), None).unwrap();
        tx.commit().unwrap();
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn settings_roundtrip_json() {
        let (_dir, cache) = open_cache();
        cache.set_setting("compression", &true).unwrap();
        assert_eq!(cache.get_setting::<bool>("compression").unwrap(), Some(true));
        assert_eq!(cache.get_setting::<bool>("missing").unwrap(), None);
    }

    #[test]
    fn snapshot_roundtrip() {
        let (_dir, cache) = open_cache();
        let root = insert_obj(&cache, 9);
        let id = cache
            .insert_snapshot(Path::new("/data"), &root, 1_530_000_000)
            .unwrap();

        let snap = cache.snapshot(id).unwrap().unwrap();
        assert_eq!(snap.path, Path::new("/data"));
        assert_eq!(snap.root_id, root);
        assert_eq!(snap.date, 1_530_000_000);

        assert!(cache.delete_snapshot(id).unwrap());
        assert!(cache.snapshot(id).unwrap().is_none());
    }
}
