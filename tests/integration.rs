//! End-to-end scenarios: scan → backup → restore round trips, deduplication,
//! disappearing files, garbage collection over shared subtrees, chunked
//! large files, and raw-byte filename preservation.

use holdfast::backup::{backup, BackupOptions};
use holdfast::cache::{ObjectRecord, Relation, SnapshotRecord};
use holdfast::codec::{self, Payload};
use holdfast::crypto::{KeyConfig, ObjectId};
use holdfast::error::Error;
use holdfast::gc::collect_garbage;
use holdfast::repo::{Repository, StorageConfig};
use holdfast::restore::restore_snapshot;
use holdfast::scan::scan;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

struct Harness {
    _tmp: tempfile::TempDir,
    source: PathBuf,
    storage_dir: PathBuf,
    db: PathBuf,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(false, None)
    }

    fn with_options(compress: bool, keys: Option<KeyConfig>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        fs::create_dir(&source).unwrap();
        let storage_dir = tmp.path().join("storage");
        let db = tmp.path().join("cache.db");

        let repo = Repository::create(
            &db,
            StorageConfig::Local {
                base_dir: storage_dir.clone(),
            },
            compress,
            keys,
        )
        .unwrap();
        repo.cache().add_root(&source).unwrap();

        Harness {
            _tmp: tmp,
            source,
            storage_dir,
            db,
        }
    }

    fn repo(&self) -> Repository {
        Repository::open(&self.db).unwrap()
    }

    fn scan(&self) {
        let repo = self.repo();
        scan(repo.cache(), &mut |_, _| {}, false).unwrap();
    }

    fn backup(&self) {
        let repo = self.repo();
        backup(
            &repo,
            &mut |_, _| {},
            &BackupOptions {
                single: true,
                cancel: None,
            },
        )
        .unwrap();
    }

    fn backup_pool(&self) {
        let repo = self.repo();
        backup(&repo, &mut |_, _| {}, &BackupOptions::default()).unwrap();
    }

    fn latest_snapshot(&self) -> SnapshotRecord {
        self.repo().cache().snapshots().unwrap().pop().unwrap()
    }

    fn restore_to(&self, name: &str) -> PathBuf {
        let dest = self._tmp.path().join(name);
        let repo = self.repo();
        restore_snapshot(&repo, &self.latest_snapshot(), &dest, None).unwrap();
        dest
    }

    fn object_count(&self) -> u64 {
        self.repo().cache().object_count().unwrap()
    }

    fn objects_of_kind(&self, kind: &str) -> u64 {
        let repo = self.repo();
        let mut count = 0;
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = repo.cache().objects_page(after.as_deref(), 100).unwrap();
            let Some(last) = page.last() else { break };
            after = Some(last.0.clone());
            for (objid, _) in page {
                let rec = repo.cache().object(&objid).unwrap().unwrap();
                if rec.kind.as_deref() == Some(kind) {
                    count += 1;
                }
            }
        }
        count
    }
}

// ─── S1: simple backup and restore ──────────────────────────────────────────

#[test]
fn simple_backup_restore() {
    let h = Harness::new();
    fs::write(h.source.join("file1"), b"contents1").unwrap();
    fs::create_dir(h.source.join("dir")).unwrap();
    fs::write(h.source.join("dir/file2"), b"contents2").unwrap();

    h.scan();
    h.backup();

    // root tree + dir tree + two inlined inodes
    assert_eq!(h.object_count(), 4);
    assert_eq!(h.repo().cache().dirty_count().unwrap(), 0);

    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("file1")).unwrap(), b"contents1");
    assert_eq!(fs::read(restored.join("dir/file2")).unwrap(), b"contents2");
}

#[test]
fn backup_requires_scan_first() {
    let h = Harness::new();
    fs::write(h.source.join("file"), b"x").unwrap();

    // The root was added but never scanned.
    let repo = h.repo();
    let result = backup(
        &repo,
        &mut |_, _| {},
        &BackupOptions {
            single: true,
            cancel: None,
        },
    );
    assert!(matches!(result, Err(Error::ScanRequired)));
}

#[test]
fn incremental_backup_reuses_unchanged_objects() {
    let h = Harness::new();
    fs::write(h.source.join("stable"), b"never changes").unwrap();
    fs::write(h.source.join("volatile"), b"version 1").unwrap();

    h.scan();
    h.backup();
    let first_count = h.object_count();

    fs::write(h.source.join("volatile"), b"version 2!").unwrap();
    h.scan();

    // Only the changed file and the invalidated root should be redone.
    assert_eq!(h.repo().cache().dirty_count().unwrap(), 2);
    h.backup();

    // One new inode + one new root tree; the stable inode is shared.
    assert_eq!(h.object_count(), first_count + 2);
    assert_eq!(h.repo().cache().snapshots().unwrap().len(), 2);
}

// ─── S2/S3: deduplication ───────────────────────────────────────────────────

#[test]
fn identical_contents_distinct_inodes() {
    let h = Harness::new();
    fs::write(h.source.join("one"), b"file contents").unwrap();
    fs::write(h.source.join("two"), b"file contents").unwrap();

    h.scan();
    h.backup();

    // Same contents but different inode numbers: the tree plus two distinct
    // inode objects (contents are inlined below the threshold, so no blobs).
    assert_eq!(h.object_count(), 3);
    assert_eq!(h.objects_of_kind("inode"), 2);
    assert_eq!(h.objects_of_kind("blob"), 0);
}

#[test]
fn hardlinks_collapse_to_one_inode() {
    let h = Harness::new();
    fs::write(h.source.join("one"), b"shared contents").unwrap();
    fs::hard_link(h.source.join("one"), h.source.join("two")).unwrap();

    h.scan();
    h.backup();

    // Two names, one inode object: identical stat fields and identical
    // contents produce the same payload bytes, hence the same id.
    assert_eq!(h.objects_of_kind("inode"), 1);
    assert_eq!(h.object_count(), 2);

    // The tree payload still lists both names, referencing the same child.
    let repo = h.repo();
    let snap = h.latest_snapshot();
    let tree = repo.get_object(&snap.root_id, None).unwrap();
    match codec::decode(&tree).unwrap() {
        Payload::Tree { entries, .. } => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].1, entries[1].1);
        }
        other => panic!("expected a tree, got {other:?}"),
    }

    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("one")).unwrap(), b"shared contents");
    assert_eq!(fs::read(restored.join("two")).unwrap(), b"shared contents");
}

// ─── S4: disappearing files ─────────────────────────────────────────────────

#[test]
fn file_disappearing_before_backup_is_skipped() {
    let h = Harness::new();
    fs::create_dir(h.source.join("dir")).unwrap();
    fs::write(h.source.join("dir/file1"), b"going away").unwrap();

    h.scan();
    fs::remove_file(h.source.join("dir/file1")).unwrap();
    h.backup();

    // The file entry was deleted mid-backup; the directory was still backed
    // up (as empty) and the run completed.
    assert_eq!(h.object_count(), 2);
    assert_eq!(h.repo().cache().entry_count().unwrap(), 2);
    assert_eq!(h.repo().cache().dirty_count().unwrap(), 0);

    let restored = h.restore_to("restored");
    assert!(restored.join("dir").is_dir());
    assert!(!restored.join("dir/file1").exists());
}

// ─── S5: garbage collection over shared subtrees ────────────────────────────

fn gc_fixture() -> (tempfile::TempDir, Repository) {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repository::create(
        &tmp.path().join("cache.db"),
        StorageConfig::Local {
            base_dir: tmp.path().join("storage"),
        },
        false,
        None,
    )
    .unwrap();
    (tmp, repo)
}

fn named_id(name: &str) -> ObjectId {
    let mut bytes = [0u8; 32];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    ObjectId::from_bytes(bytes)
}

fn insert_graph(repo: &Repository, edges: &[(&str, &[&str])]) {
    // Objects first: relations are foreign keys into the objects table.
    for (name, _) in edges {
        let id = named_id(name);
        repo.cache()
            .insert_object(&ObjectRecord {
                objid: id,
                kind: Some("tree".into()),
                payload: None,
                uploaded_size: Some(1),
                file_size: None,
                last_modified_time: None,
            })
            .unwrap();
        repo.storage()
            .put(&Repository::object_name(&id), name.as_bytes())
            .unwrap();
    }
    for (name, children) in edges {
        let relations: Vec<Relation> = children
            .iter()
            .map(|c| Relation {
                child: named_id(c),
                name: None,
            })
            .collect();
        repo.cache()
            .insert_relations(&named_id(name), &relations)
            .unwrap();
    }
}

#[test]
fn gc_never_touches_reachable_objects() {
    let (_tmp, repo) = gc_fixture();

    // Two trees sharing B (and through it D, E, F).
    insert_graph(
        &repo,
        &[
            ("A", &["B", "C"][..]),
            ("B", &["D", "E"][..]),
            ("C", &[][..]),
            ("D", &["F"][..]),
            ("E", &[][..]),
            ("F", &[][..]),
            ("G", &["B", "H"][..]),
            ("H", &["I", "J"][..]),
            ("I", &["F"][..]),
            ("J", &[][..]),
        ],
    );
    let snap_a = repo
        .cache()
        .insert_snapshot(Path::new("/a"), &named_id("A"), 100)
        .unwrap();
    repo.cache()
        .insert_snapshot(Path::new("/g"), &named_id("G"), 100)
        .unwrap();
    assert_eq!(repo.cache().object_count().unwrap(), 10);

    // Everything is reachable: nothing may be collected.
    let stats = collect_garbage(&repo, &mut |_, _| {}, None).unwrap();
    assert_eq!(stats.deleted, 0);

    // Drop snapshot A: only A and C can ever become garbage.
    repo.cache().delete_snapshot(snap_a).unwrap();

    let safe = ["B", "D", "E", "F", "G", "H", "I", "J"];
    // Collection is probabilistic; repeated runs approach full collection.
    for _ in 0..200 {
        collect_garbage(&repo, &mut |_, _| {}, None).unwrap();
        for name in safe {
            assert!(
                repo.cache()
                    .object_exists(named_id(name).as_bytes())
                    .unwrap(),
                "GC deleted reachable object {name}"
            );
        }
        let a = repo.cache().object_exists(named_id("A").as_bytes()).unwrap();
        let c = repo.cache().object_exists(named_id("C").as_bytes()).unwrap();
        if !a && !c {
            break;
        }
    }

    assert!(!repo.cache().object_exists(named_id("A").as_bytes()).unwrap());
    assert!(!repo.cache().object_exists(named_id("C").as_bytes()).unwrap());
    // The remote blobs went with the rows.
    assert!(repo
        .storage()
        .get(&Repository::object_name(&named_id("A")))
        .is_err());
    assert_eq!(repo.cache().object_count().unwrap(), 8);
}

#[test]
fn gc_reclaims_objects_orphaned_by_changed_files() {
    let h = Harness::new();
    fs::write(h.source.join("file"), b"version 1").unwrap();
    h.scan();
    h.backup();

    fs::write(h.source.join("file"), b"version 2?").unwrap();
    h.scan();
    h.backup();

    // Drop the first snapshot; its unique tree + inode become garbage.
    let repo = h.repo();
    let first = repo.cache().snapshots().unwrap().remove(0);
    repo.cache().delete_snapshot(first.id).unwrap();

    let before = h.object_count();
    for _ in 0..200 {
        collect_garbage(&h.repo(), &mut |_, _| {}, None).unwrap();
        if h.object_count() == 2 {
            break;
        }
    }
    assert!(h.object_count() < before);
    assert_eq!(h.object_count(), 2);

    // The surviving snapshot still restores.
    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("file")).unwrap(), b"version 2?");
}

// ─── S6: large files and chunking ───────────────────────────────────────────

#[test]
fn large_file_chunks_and_restores() {
    let h = Harness::new();

    // 5 MiB, each MiB distinct so every chunk is a distinct object.
    let mut data = Vec::with_capacity(5 << 20);
    for i in 0u8..5 {
        data.extend(std::iter::repeat(i + 1).take(1 << 20));
    }
    fs::write(h.source.join("big"), &data).unwrap();

    h.scan();
    h.backup();

    assert_eq!(h.objects_of_kind("blob"), 5);
    assert_eq!(h.objects_of_kind("inode"), 1);
    assert_eq!(h.objects_of_kind("tree"), 1);

    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("big")).unwrap(), data);
}

#[test]
fn repeated_chunks_deduplicate() {
    let h = Harness::new();

    // 50 MiB of zeros: every 1 MiB chunk is identical, so exactly one blob
    // object exists no matter how many chunks reference it.
    let data = vec![0u8; 50 << 20];
    fs::write(h.source.join("zeros"), &data).unwrap();

    h.scan();
    h.backup();

    assert_eq!(h.objects_of_kind("blob"), 1);
    assert_eq!(h.object_count(), 3);

    // The inode still records all 50 chunk references in order.
    let repo = h.repo();
    let inode_entry = repo
        .cache()
        .entry_by_path(&h.source.join("zeros"))
        .unwrap()
        .unwrap();
    let payload = repo.get_object(&inode_entry.obj_id.unwrap(), None).unwrap();
    match codec::decode(&payload).unwrap() {
        Payload::Inode {
            contents: codec::Contents::ChunkList(chunks),
            ..
        } => {
            assert_eq!(chunks.len(), 50);
            let ids: HashSet<ObjectId> = chunks.iter().map(|(_, id)| *id).collect();
            assert_eq!(ids.len(), 1);
        }
        other => panic!("expected a chunked inode, got {other:?}"),
    }

    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("zeros")).unwrap(), data);
}

// ─── S7: raw-byte filenames ─────────────────────────────────────────────────

#[test]
fn invalid_utf8_filenames_survive_roundtrip() {
    let h = Harness::new();
    let name = OsString::from_vec(vec![0xff, 0xff, b'H', b'e', b'l', b'l', b'o', 0xff, 0xff]);
    fs::write(h.source.join(&name), b"odd name, plain contents").unwrap();

    h.scan();
    h.backup();

    // The tree payload carries the exact original bytes.
    let repo = h.repo();
    let tree = repo.get_object(&h.latest_snapshot().root_id, None).unwrap();
    match codec::decode(&tree).unwrap() {
        Payload::Tree { entries, .. } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(
                entries[0].0,
                vec![0xff, 0xff, b'H', b'e', b'l', b'l', b'o', 0xff, 0xff]
            );
        }
        other => panic!("expected a tree, got {other:?}"),
    }

    let restored = h.restore_to("restored");
    let listed: Vec<OsString> = fs::read_dir(&restored)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(listed, vec![name.clone()]);
    assert_eq!(
        fs::read(restored.join(&name)).unwrap(),
        b"odd name, plain contents"
    );
}

// ─── Metadata round trips ───────────────────────────────────────────────────

#[test]
fn modes_and_times_roundtrip() {
    let h = Harness::new();
    let file = h.source.join("file");
    let dir = h.source.join("dir");
    fs::write(&file, b"contents").unwrap();
    fs::create_dir(&dir).unwrap();

    fs::set_permissions(&file, fs::Permissions::from_mode(0o751)).unwrap();
    let mtime = filetime::FileTime::from_unix_time(1_500_000_000, 123_456_789);
    let atime = filetime::FileTime::from_unix_time(1_500_000_001, 987_654_321);
    filetime::set_file_times(&file, atime, mtime).unwrap();
    filetime::set_file_times(&dir, atime, mtime).unwrap();

    h.scan();
    h.backup();
    let restored = h.restore_to("restored");

    let md = fs::symlink_metadata(restored.join("file")).unwrap();
    assert_eq!(md.mode() & 0o7777, 0o751);
    assert_eq!(md.mtime(), 1_500_000_000);
    assert_eq!(md.mtime_nsec(), 123_456_789);
    assert_eq!(md.atime(), 1_500_000_001);
    assert_eq!(md.atime_nsec(), 987_654_321);

    // Directory times survive because children are written before the
    // directory's own properties are applied.
    let md = fs::symlink_metadata(restored.join("dir")).unwrap();
    assert_eq!(md.mtime(), 1_500_000_000);
    assert_eq!(md.mtime_nsec(), 123_456_789);
}

// ─── Repository invariants ──────────────────────────────────────────────────

#[test]
fn every_cached_object_exists_remotely_and_verifies() {
    let h = Harness::new();
    fs::write(h.source.join("a"), b"alpha").unwrap();
    fs::create_dir(h.source.join("d")).unwrap();
    fs::write(h.source.join("d/b"), b"beta").unwrap();

    h.scan();
    h.backup();

    let repo = h.repo();
    let mut checked = 0;
    let mut after: Option<Vec<u8>> = None;
    loop {
        let page = repo.cache().objects_page(after.as_deref(), 100).unwrap();
        let Some(last) = page.last() else { break };
        after = Some(last.0.clone());
        for (raw, _) in page {
            let objid = ObjectId::try_from(raw.as_slice()).unwrap();
            // get_object re-derives the address from the downloaded payload
            // and fails on any mismatch.
            let payload = repo.get_object(&objid, None).unwrap();
            assert!(!payload.is_empty());
            checked += 1;
        }
    }
    assert_eq!(checked, 4);

    // And the snapshot object landed under snapshots/.
    assert_eq!(h.repo().storage().list("snapshots/").unwrap().len(), 1);
}

#[test]
fn pool_and_single_mode_agree() {
    let h = Harness::new();
    for i in 0..10 {
        let dir = h.source.join(format!("dir{i}"));
        fs::create_dir(&dir).unwrap();
        for j in 0..5 {
            fs::write(dir.join(format!("file{j}")), format!("{i}-{j}")).unwrap();
        }
    }

    h.scan();
    h.backup_pool();

    assert_eq!(h.repo().cache().dirty_count().unwrap(), 0);
    // 1 root tree + 10 dir trees + 50 inodes
    assert_eq!(h.object_count(), 61);

    let restored = h.restore_to("restored");
    assert_eq!(fs::read(restored.join("dir3/file2")).unwrap(), b"3-2");
    assert_eq!(fs::read(restored.join("dir9/file4")).unwrap(), b"9-4");
}

// ─── Encryption and compression end to end ──────────────────────────────────

#[test]
fn encrypted_compressed_roundtrip() {
    let keys = KeyConfig::generate_with_params("long passphrase", 8, 1, 1).unwrap();
    let h = Harness::with_options(true, Some(keys));
    fs::write(h.source.join("secret"), b"attack at dawn").unwrap();

    h.scan();
    h.backup();

    // Nothing in storage contains the plaintext.
    for name in h.repo().storage().list("objects/").unwrap() {
        let stored = h.repo().storage().get(&name).unwrap();
        assert!(!stored
            .windows(b"attack at dawn".len())
            .any(|w| w == b"attack at dawn"));
    }

    // Restoring without the key fails fast; with it, bytes come back.
    let repo = h.repo();
    let snap = h.latest_snapshot();
    assert!(matches!(
        repo.get_object(&snap.root_id, None),
        Err(Error::KeyRequired)
    ));

    let key = repo.unlock_key("long passphrase").unwrap();
    let dest = h._tmp.path().join("restored");
    restore_snapshot(&repo, &snap, &dest, Some(&key)).unwrap();
    assert_eq!(fs::read(dest.join("secret")).unwrap(), b"attack at dawn");
}

#[test]
fn recovery_object_is_uploaded() {
    let keys = KeyConfig::generate_with_params("pw", 8, 1, 1).unwrap();
    let h = Harness::with_options(false, Some(keys));

    let raw = fs::read(
        holdfast::storage::local_path(&h.storage_dir, holdfast::repo::RECOVERY_OBJECT),
    )
    .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    // Public parameters and the wrapped key are all a reader needs besides
    // the password.
    assert!(parsed["encryption"]["public_key"].is_string());
    assert!(parsed["encryption"]["wrapped_key"].is_string());
    assert!(parsed["encryption"]["salt"].is_string());
}
