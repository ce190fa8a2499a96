//! # Garbage Collector
//!
//! Removes objects no longer reachable from any snapshot, using a bloom
//! filter over the reachable set rather than exact mark-and-sweep: the
//! first pass is read-only and the memory bound is ~760 KB per million
//! objects at the target false-positive rate. An object missing from the
//! filter is provably unreachable; false positives only mean some garbage
//! survives until a later run, never that live data is deleted.
//!
//! The "hash functions" are four fresh cryptographically random 256-bit
//! salts XOR'd with the object id — fresh each run, so an unlucky collision
//! does not persist across runs.
//!
//! Callers hold the database's reserved write lock across both phases; a
//! concurrent `push_object` would otherwise create rows the filter never
//! saw.

use crate::error::{Result, StorageError};
use crate::repo::Repository;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Target false-positive rate for the bloom filter.
const TARGET_FP_RATE: f64 = 0.05;

/// Number of hash salts; optimal for the target rate.
const NUM_HASHES: usize = 4;

/// Objects examined per sweep query.
const SWEEP_BATCH: usize = 1000;

/// Summary of a collection run.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Objects deleted (locally and remotely).
    pub deleted: u64,
    /// Sum of the deleted objects' uploaded sizes.
    pub bytes_reclaimed: u64,
}

/// Two-phase collector: [`GarbageCollector::build_filter`] walks the
/// reachable set read-only, then [`GarbageCollector::delete_garbage`] sweeps
/// every object row against the filter.
pub struct GarbageCollector<'r> {
    repo: &'r Repository,
    bloom: Vec<u8>,
    m: u64,
    salts: Vec<[u8; 32]>,
}

impl<'r> GarbageCollector<'r> {
    pub fn new(repo: &'r Repository) -> Self {
        Self {
            repo,
            bloom: Vec::new(),
            m: 0,
            salts: Vec::new(),
        }
    }

    /// Sizes the filter from the current object count and sets a bit per
    /// (salt, reachable object) pair by walking the snapshot roots through
    /// the relations table in a single recursive query.
    pub fn build_filter(&mut self) -> Result<()> {
        let count = self.repo.cache().object_count()?;
        if count == 0 {
            self.m = 0;
            return Ok(());
        }

        // m = ceil(n * ln(p) / ln(1 / 2^(ln 2))) bits
        let m = ((count as f64 * TARGET_FP_RATE.ln())
            / (1.0 / 2f64.powf(2f64.ln())).ln())
        .ceil() as u64;
        let m = m.max(8);

        self.bloom = vec![0u8; m.div_ceil(8) as usize];
        self.m = m;
        self.salts = (0..NUM_HASHES)
            .map(|_| {
                let mut salt = [0u8; 32];
                OsRng.fill_bytes(&mut salt);
                salt
            })
            .collect();

        let bloom = &mut self.bloom;
        let salts = &self.salts;
        self.repo.cache().for_each_reachable(|objid| {
            for salt in salts {
                let bit = bit_index(salt, objid, m);
                bloom[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        })?;

        debug!(objects = count, bits = m, "bloom filter built");
        Ok(())
    }

    /// True when the filter *may* contain the object. A clear bit at any
    /// salt proves the object unreachable.
    fn may_be_reachable(&self, objid: &[u8]) -> bool {
        if self.m == 0 {
            return false;
        }
        self.salts.iter().all(|salt| {
            let bit = bit_index(salt, objid, self.m);
            self.bloom[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Sweeps every object row against the filter, deleting the remote blob
    /// and then the local row for each provably unreachable object.
    ///
    /// Blob deletion failures are logged and skipped — the sweep continues
    /// and the caller's enclosing transaction is never rolled back for them.
    /// A missing remote blob still deletes the row (the object is garbage
    /// either way).
    pub fn delete_garbage(&self, progress: &mut dyn FnMut(u64, Option<u64>)) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let mut after: Option<Vec<u8>> = None;

        loop {
            let page = self
                .repo
                .cache()
                .objects_page(after.as_deref(), SWEEP_BATCH)?;
            let Some(last) = page.last() else { break };
            after = Some(last.0.clone());

            for (objid, uploaded_size) in page {
                if self.may_be_reachable(&objid) {
                    continue;
                }

                match self.repo.delete_blob(&objid) {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(
                            objid = %hex::encode(&objid),
                            error = %e,
                            "failed to delete remote blob, skipping"
                        );
                        continue;
                    }
                }
                self.repo.cache().delete_object(&objid)?;

                stats.deleted += 1;
                stats.bytes_reclaimed += uploaded_size.unwrap_or(0);
                progress(stats.deleted, None);
            }
        }

        Ok(stats)
    }
}

/// Collects garbage in one call, holding the reserved write lock across
/// both phases. `cancel` is honored between the phases; a run interrupted
/// there has done nothing destructive.
///
/// Not all garbage is collected in one run; repeated runs approach full
/// collection.
pub fn collect_garbage(
    repo: &Repository,
    progress: &mut dyn FnMut(u64, Option<u64>),
    cancel: Option<&AtomicBool>,
) -> Result<GcStats> {
    let tx = repo.cache().immediate()?;

    let mut gc = GarbageCollector::new(repo);
    gc.build_filter()?;

    if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
        info!("interrupt received, canceling garbage collection");
        tx.commit()?;
        return Ok(GcStats::default());
    }

    let stats = gc.delete_garbage(progress)?;
    tx.commit()?;

    info!(
        deleted = stats.deleted,
        bytes = stats.bytes_reclaimed,
        "garbage collection finished"
    );
    Ok(stats)
}

/// Bit position for one (salt, objid) pair: the object id, interpreted as a
/// little-endian integer, XOR'd into the salt and reduced mod `m`.
fn bit_index(salt: &[u8; 32], objid: &[u8], m: u64) -> u64 {
    let mut bytes = *salt;
    for (i, b) in objid.iter().take(32).enumerate() {
        bytes[i] ^= b;
    }

    // Reduce the 256-bit value most-significant byte first.
    let mut acc: u128 = 0;
    let m = m as u128;
    for &b in bytes.iter().rev() {
        acc = ((acc << 8) | b as u128) % m;
    }
    acc as u64
}
