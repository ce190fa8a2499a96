//! # holdfast
//!
//! A content-addressed deduplicating backup engine with incremental
//! scanning, optional compression and encryption, and snapshot management.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  CLI (clap)  │
//!                      └──────┬───────┘
//!                             │
//!        ┌──────────┬─────────┼──────────┬─────────┐
//!        ▼          ▼         ▼          ▼         ▼
//!   ┌────────┐ ┌────────┐ ┌─────────┐ ┌────┐ ┌─────────┐
//!   │  Scan  │ │ Backup │ │ Restore │ │ GC │ │ Roots   │
//!   └───┬────┘ └───┬────┘ └────┬────┘ └─┬──┘ └────┬────┘
//!       │          │           │         │         │
//!       ▼          ▼           ▼         ▼         ▼
//!   ┌──────────────────────────────────────────────────┐
//!   │        Repository (push_object / get_object)     │
//!   │  codec (msgpack) → compress (zlib) → seal (box)  │
//!   └──────┬─────────────────────────────────┬─────────┘
//!          ▼                                 ▼
//!   ┌────────────┐                    ┌─────────────┐
//!   │   Cache    │                    │   Storage   │
//!   │  (SQLite)  │                    │ (port/local)│
//!   └────────────┘                    └─────────────┘
//! ```
//!
//! ## How a backup works
//!
//! 1. The scanner reconciles the cache with the live filesystem, marking
//!    changed entries dirty and discovering new ones breadth-first.
//! 2. The pipeline repeatedly selects dirty entries whose children are all
//!    done, and hands batches to workers.
//! 3. Each entry's generator yields payloads child-first; every payload is
//!    hashed into an id, deduplicated against the cache, framed
//!    (compress-then-encrypt), and uploaded if new.
//! 4. Once every root is materialized, one snapshot per root is recorded
//!    and uploaded. Garbage collection later reclaims objects no snapshot
//!    reaches.

pub mod backup;
pub mod cache;
pub mod chunker;
pub mod codec;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod gc;
pub mod repo;
pub mod restore;
pub mod scan;
pub mod storage;

pub use crate::backup::{backup, BackupOptions, BackupStats};
pub use crate::cache::Cache;
pub use crate::crypto::{Encrypter, KeyConfig, ObjectId};
pub use crate::error::{Error, Result};
pub use crate::gc::collect_garbage;
pub use crate::repo::{RepoConfig, Repository, StorageConfig};
pub use crate::restore::{restore_item, restore_snapshot};
pub use crate::scan::scan;
