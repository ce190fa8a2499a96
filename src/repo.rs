//! # Repository Facade
//!
//! Owns the object codec, the storage adapter, and the metadata cache, and
//! exposes the two operations everything else is built from: `push_object`
//! and `get_object`.
//!
//! A pushed object writes a cache row *and* uploads a blob, and neither must
//! exist without the other. The upload happens inside the database
//! transaction that inserts the row, and the transaction commits only when
//! the upload succeeded. A crash mid-push therefore leaves no local row and
//! at most one orphaned remote blob, which a later GC pass reclaims.

use crate::cache::{Cache, ObjectRecord, Relation, SnapshotRecord};
use crate::codec;
use crate::compress;
use crate::crypto::{Encrypter, KeyConfig, ObjectId};
use crate::error::{CorruptedRepository, Error, Result};
use crate::storage::{FilesystemStorage, Storage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files smaller than this are inlined into their inode payload instead of
/// going through the chunker (2 MiB).
pub const DEFAULT_INLINE_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Name of the well-known recovery object in the repository. Holds the
/// public encryption parameters and the password-wrapped private key so a
/// lost cache can be rebuilt from the password alone.
pub const RECOVERY_OBJECT: &str = "holdfast.config";

const SETTING_STORAGE: &str = "storage";
const SETTING_COMPRESSION: &str = "compression";
const SETTING_ENCRYPTION: &str = "encryption";
const SETTING_INLINE_THRESHOLD: &str = "inline_threshold";

/// Which storage backend a repository uses, persisted in settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// A directory on the local filesystem.
    Local { base_dir: PathBuf },
}

impl StorageConfig {
    fn build(&self) -> Box<dyn Storage> {
        match self {
            StorageConfig::Local { base_dir } => Box::new(FilesystemStorage::new(base_dir)),
        }
    }
}

/// An immutable snapshot of a repository's configuration.
///
/// Captured once at dispatcher startup and handed to each worker, which
/// opens its own database connection from it — cache connections are never
/// shared across threads.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub db_path: PathBuf,
    pub storage: StorageConfig,
    pub compression: bool,
    pub keys: Option<KeyConfig>,
    pub inline_threshold: u64,
}

/// Contents of the recovery object, serialized as JSON.
#[derive(Debug, Serialize, Deserialize)]
struct RecoveryInfo {
    compression: bool,
    encryption: Option<KeyConfig>,
}

/// Interface to one repository: its cache database, storage backend, and
/// encryption configuration.
pub struct Repository {
    cache: Cache,
    storage: Box<dyn Storage>,
    encrypter: Encrypter,
    config: RepoConfig,
}

impl Repository {
    /// Initializes a new repository: persists the settings into a fresh
    /// cache database and uploads the recovery object.
    pub fn create(
        db_path: &Path,
        storage: StorageConfig,
        compression: bool,
        keys: Option<KeyConfig>,
    ) -> Result<Repository> {
        let cache = Cache::open(db_path)?;
        if cache
            .get_setting::<StorageConfig>(SETTING_STORAGE)?
            .is_some()
        {
            return Err(Error::Config(format!(
                "repository already initialized at {}",
                db_path.display()
            )));
        }

        cache.set_setting(SETTING_STORAGE, &storage)?;
        cache.set_setting(SETTING_COMPRESSION, &compression)?;
        cache.set_setting(SETTING_ENCRYPTION, &keys)?;
        cache.set_setting(SETTING_INLINE_THRESHOLD, &DEFAULT_INLINE_THRESHOLD)?;
        drop(cache);

        let repo = Self::open(db_path)?;
        repo.save_recovery_info()?;
        Ok(repo)
    }

    /// Opens an initialized repository from its cache database path.
    pub fn open(db_path: &Path) -> Result<Repository> {
        let cache = Cache::open(db_path)?;

        let storage = cache
            .get_setting::<StorageConfig>(SETTING_STORAGE)?
            .ok_or_else(|| {
                Error::Config(format!(
                    "repository not initialized at {} (run init first)",
                    db_path.display()
                ))
            })?;
        let compression = cache
            .get_setting::<bool>(SETTING_COMPRESSION)?
            .unwrap_or(false);
        let keys = cache
            .get_setting::<Option<KeyConfig>>(SETTING_ENCRYPTION)?
            .flatten();
        let inline_threshold = cache
            .get_setting::<u64>(SETTING_INLINE_THRESHOLD)?
            .unwrap_or(DEFAULT_INLINE_THRESHOLD);

        let config = RepoConfig {
            db_path: db_path.to_path_buf(),
            storage,
            compression,
            keys,
            inline_threshold,
        };
        Self::from_config(&config)
    }

    /// Opens a repository from a previously captured configuration snapshot,
    /// with a fresh database connection. This is how worker threads come up.
    pub fn from_config(config: &RepoConfig) -> Result<Repository> {
        let cache = Cache::open(&config.db_path)?;
        let encrypter = match &config.keys {
            Some(keys) => keys.encrypter()?,
            None => Encrypter::Null,
        };
        Ok(Repository {
            cache,
            storage: config.storage.build(),
            encrypter,
            config: config.clone(),
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn encrypter(&self) -> &Encrypter {
        &self.encrypter
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn inline_threshold(&self) -> u64 {
        self.config.inline_threshold
    }

    /// Recovers the decryption key from the locally stored wrap parameters.
    pub fn unlock_key(&self, password: &str) -> Result<crypto_box::SecretKey> {
        match &self.config.keys {
            Some(keys) => keys.unlock(password),
            None => Err(Error::Config(
                "this repository is not encrypted; no key to unlock".into(),
            )),
        }
    }

    /// Storage name for an object: `objects/{first_3_hex}/{full_hex}`.
    pub fn object_name(objid: &ObjectId) -> String {
        let hex = objid.to_hex();
        format!("objects/{}/{}", &hex[..3], hex)
    }

    fn object_name_raw(objid: &[u8]) -> String {
        let hex = hex::encode(objid);
        format!("objects/{}/{}", &hex[..3.min(hex.len())], hex)
    }

    /// Pushes a payload into the object store, deduplicating against objects
    /// already known to the cache.
    ///
    /// For a new object this inserts the cache row and the (deduplicated)
    /// relations, then uploads the framed payload — all inside one immediate
    /// transaction, so an upload failure rolls everything back. For a known
    /// object it sanity-checks that the cached payload and recorded child
    /// set match what the caller produced; a mismatch means content
    /// addressing is broken somewhere and is fatal.
    pub fn push_object(&self, payload: &[u8], relations: &[Relation]) -> Result<ObjectRecord> {
        let objid = self.encrypter.object_id(payload);

        let tx = self.cache.immediate()?;
        if let Some(existing) = self.cache.object(objid.as_bytes())? {
            if let Some(cached) = existing.payload.as_deref() {
                assert!(
                    cached == payload,
                    "object {objid} exists with a different cached payload"
                );
            }
            let recorded: HashSet<Vec<u8>> = self
                .cache
                .object_children(objid.as_bytes())?
                .into_iter()
                .collect();
            let given: HashSet<Vec<u8>> = relations
                .iter()
                .map(|r| r.child.as_bytes().to_vec())
                .collect();
            assert!(
                recorded == given,
                "object {objid} exists with a different child set"
            );
            tx.commit()?;
            debug!(objid = %objid.short(), "object already present, deduplicated");
            return Ok(existing);
        }

        let framed = self
            .encrypter
            .encrypt(&compress::compress(payload, self.config.compression)?)?;
        let record = ObjectRecord::from_payload(objid, payload, framed.len() as u64)?;

        self.cache.insert_object(&record)?;
        self.cache.insert_relations(&objid, relations)?;
        self.storage.put(&Self::object_name(&objid), &framed)?;
        tx.commit()?;

        debug!(objid = %objid.short(), size = framed.len(), "object uploaded");
        Ok(record)
    }

    /// Downloads an object and returns its verified plaintext payload.
    ///
    /// Undoes the framing (decrypt, then auto-detected decompress),
    /// re-derives the address from the recovered plaintext, and compares it
    /// to the requested id in constant time. Download, decrypt, or framing
    /// failures — and any id mismatch — surface as [`CorruptedRepository`];
    /// a missing decryption key surfaces as [`Error::KeyRequired`].
    pub fn get_object(
        &self,
        objid: &ObjectId,
        key: Option<&crypto_box::SecretKey>,
    ) -> Result<Vec<u8>> {
        let name = Self::object_name(objid);
        let raw = self
            .storage
            .get(&name)
            .map_err(|e| CorruptedRepository(format!("failed to read object {objid}: {e}")))?;

        let plain = match self.encrypter.decrypt(&raw, key) {
            Ok(plain) => plain,
            Err(Error::KeyRequired) => return Err(Error::KeyRequired),
            Err(e) => {
                return Err(
                    CorruptedRepository(format!("failed to decrypt object {objid}: {e}")).into(),
                )
            }
        };
        let plain = compress::decompress(&plain)
            .map_err(|e| CorruptedRepository(format!("failed to decompress object {objid}: {e}")))?;

        let digest = self.encrypter.object_id(&plain);
        if !digest.ct_eq(objid) {
            return Err(CorruptedRepository(format!(
                "object payload does not match its id for {objid}"
            ))
            .into());
        }
        Ok(plain)
    }

    /// Uploads a snapshot object under `snapshots/{uuid}`.
    pub fn put_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let payload = codec::encode_snapshot(
            snapshot.date,
            &snapshot.root_id,
            snapshot.path.as_os_str().as_bytes(),
        )?;
        let framed = self
            .encrypter
            .encrypt(&compress::compress(&payload, self.config.compression)?)?;
        let name = format!("snapshots/{}", uuid::Uuid::new_v4());
        self.storage.put(&name, &framed)?;
        debug!(name, root = %snapshot.root_id.short(), "snapshot uploaded");
        Ok(())
    }

    /// Deletes an object's remote blob. Used by GC, which works on raw ids
    /// straight out of the database.
    pub fn delete_blob(&self, objid: &[u8]) -> std::result::Result<(), crate::error::StorageError> {
        self.storage.delete(&Self::object_name_raw(objid))
    }

    /// Re-uploads the recovery object from current settings.
    pub fn save_recovery_info(&self) -> Result<()> {
        let info = RecoveryInfo {
            compression: self.config.compression,
            encryption: self.config.keys.clone(),
        };
        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| Error::Config(format!("cannot serialize recovery info: {e}")))?;
        self.storage.put(RECOVERY_OBJECT, &json)?;
        Ok(())
    }
}

impl ObjectRecord {
    /// Builds the cache row for a freshly pushed payload, decoding it just
    /// enough to fill in the cached hints. Inode and tree payloads are kept
    /// locally; blob payloads never are.
    pub fn from_payload(objid: ObjectId, payload: &[u8], uploaded_size: u64) -> Result<Self> {
        let kind = codec::kind(payload)?;
        let mut record = ObjectRecord {
            objid,
            kind: Some(kind.as_str().to_string()),
            payload: None,
            uploaded_size: Some(uploaded_size),
            file_size: None,
            last_modified_time: None,
        };

        match kind {
            codec::Kind::Inode => {
                if let codec::Payload::Inode { info, .. } = codec::decode(payload)? {
                    record.file_size = Some(info.size);
                    record.last_modified_time = Some(info.mtime_ns / 1_000_000_000);
                }
                record.payload = Some(payload.to_vec());
            }
            codec::Kind::Tree => {
                if let codec::Payload::Tree { info, .. } = codec::decode(payload)? {
                    record.last_modified_time = Some(info.mtime_ns / 1_000_000_000);
                }
                record.payload = Some(payload.to_vec());
            }
            _ => {}
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Contents;

    fn test_repo(compression: bool, keys: Option<KeyConfig>) -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::create(
            &dir.path().join("cache.db"),
            StorageConfig::Local {
                base_dir: dir.path().join("storage"),
            },
            compression,
            keys,
        )
        .unwrap();
        (dir, repo)
    }

    #[test]
    fn push_then_get_roundtrips() {
        let (_dir, repo) = test_repo(false, None);
        let payload = codec::encode_blob(b"chunk data").unwrap();

        let rec = repo.push_object(&payload, &[]).unwrap();
        assert_eq!(rec.kind.as_deref(), Some("blob"));
        assert!(rec.payload.is_none(), "blob payloads are not cached");

        let fetched = repo.get_object(&rec.objid, None).unwrap();
        assert_eq!(fetched, payload);
    }

    #[test]
    fn push_is_idempotent() {
        let (_dir, repo) = test_repo(false, None);
        let payload = codec::encode_blob(b"same").unwrap();

        let a = repo.push_object(&payload, &[]).unwrap();
        let b = repo.push_object(&payload, &[]).unwrap();
        assert_eq!(a.objid, b.objid);
        assert_eq!(repo.cache().object_count().unwrap(), 1);
    }

    #[test]
    fn inode_payloads_are_cached_locally() {
        let (_dir, repo) = test_repo(false, None);
        let payload = codec::encode_inode(
            &codec::FileInfo {
                size: 5,
                mtime_ns: 3_000_000_000,
                ..Default::default()
            },
            &Contents::Immediate(b"hello".to_vec()),
        )
        .unwrap();

        let rec = repo.push_object(&payload, &[]).unwrap();
        assert_eq!(rec.payload.as_deref(), Some(payload.as_slice()));
        assert_eq!(rec.file_size, Some(5));
        assert_eq!(rec.last_modified_time, Some(3));
    }

    #[test]
    fn tampered_object_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let storage_dir = dir.path().join("storage");
        let repo = Repository::create(
            &dir.path().join("cache.db"),
            StorageConfig::Local {
                base_dir: storage_dir.clone(),
            },
            false,
            None,
        )
        .unwrap();

        let payload = codec::encode_blob(b"original").unwrap();
        let rec = repo.push_object(&payload, &[]).unwrap();

        // Overwrite the stored object with different bytes
        let path = crate::storage::local_path(&storage_dir, &Repository::object_name(&rec.objid));
        std::fs::write(&path, codec::encode_blob(b"tampered").unwrap()).unwrap();

        assert!(matches!(
            repo.get_object(&rec.objid, None),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn missing_object_is_corrupt() {
        let (_dir, repo) = test_repo(false, None);
        let objid = crate::crypto::Encrypter::Null.object_id(b"never pushed");
        assert!(matches!(
            repo.get_object(&objid, None),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn failed_upload_rolls_back_the_row() {
        let dir = tempfile::tempdir().unwrap();
        // A base dir that is a *file* makes every put fail.
        let bogus = dir.path().join("not-a-dir");
        std::fs::write(&bogus, b"x").unwrap();

        let db = dir.path().join("cache.db");
        {
            let cache = Cache::open(&db).unwrap();
            cache
                .set_setting(
                    SETTING_STORAGE,
                    &StorageConfig::Local {
                        base_dir: bogus.clone(),
                    },
                )
                .unwrap();
            cache.set_setting(SETTING_COMPRESSION, &false).unwrap();
        }

        let repo = Repository::open(&db).unwrap();
        let payload = codec::encode_blob(b"data").unwrap();
        assert!(repo.push_object(&payload, &[]).is_err());
        assert_eq!(repo.cache().object_count().unwrap(), 0);
    }

    #[test]
    fn encrypted_roundtrip_with_compression() {
        let keys = KeyConfig::generate_with_params("pw", 8, 1, 1).unwrap();
        let (_dir, repo) = test_repo(true, Some(keys.clone()));
        let key = keys.unlock("pw").unwrap();

        let payload = codec::encode_blob(&vec![b'z'; 4096]).unwrap();
        let rec = repo.push_object(&payload, &[]).unwrap();

        assert!(matches!(
            repo.get_object(&rec.objid, None),
            Err(Error::KeyRequired)
        ));
        assert_eq!(repo.get_object(&rec.objid, Some(&key)).unwrap(), payload);
    }

    #[test]
    fn stored_bytes_are_not_plaintext_when_encrypted() {
        let keys = KeyConfig::generate_with_params("pw", 8, 1, 1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage_dir = dir.path().join("storage");
        let repo = Repository::create(
            &dir.path().join("cache.db"),
            StorageConfig::Local {
                base_dir: storage_dir.clone(),
            },
            false,
            Some(keys),
        )
        .unwrap();

        let payload = codec::encode_blob(b"super secret contents").unwrap();
        let rec = repo.push_object(&payload, &[]).unwrap();

        let path = crate::storage::local_path(&storage_dir, &Repository::object_name(&rec.objid));
        let stored = std::fs::read(path).unwrap();
        assert!(!stored
            .windows(b"super secret contents".len())
            .any(|w| w == b"super secret contents"));
    }
}
