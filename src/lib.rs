//! # RockyardKV
//!
//! An embeddable, ordered key-value storage engine built on a
//! **log-structured merge tree**: a write-ahead log for durability,
//! immutable sorted tables on disk, and a manifest/CURRENT protocol that
//! names the canonical set of live files. Designed so that the exact
//! ordering of file-system operations — append, sync, rename,
//! directory-sync — is auditable and crash-testable at every step.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Database                           │
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │  │  Active    │   │   Sealed     │   │  Tables (.sst) │   │
//! │  │  memtable  │──▶│  memtables   │──▶│  per level     │   │
//! │  │  + WAL     │   │  (flushing)  │   │                │   │
//! │  └────────────┘   └──────────────┘   └────────────────┘   │
//! │        ▲                                       ▲          │
//! │   write queue                          manifest + CURRENT │
//! │                                                           │
//! │  everything above runs on a pluggable virtual filesystem  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Engine: open/recover, write queue, reads, flush & compaction jobs, close |
//! | [`batch`] | Atomic write batches (the WAL payload format) |
//! | [`memtable`] | Lock-free in-memory buffer over internal keys |
//! | [`wal`] | CRC32C block-framed record log (WAL + manifest framing) |
//! | [`sstable`] | Immutable block-structured tables with bloom filters |
//! | [`manifest`] | Version edits, the version set, and the CURRENT protocol |
//! | [`vfs`] | Virtual filesystem: standard, fault-injection, direct-I/O |
//! | [`keys`] | Internal-key format (user key ∥ sequence/kind tag) |
//! | [`encoding`] | Byte-stable primitives shared by every on-disk format |
//! | [`filenames`] | Database-directory naming |
//! | [`crashpoint`] | Kill points & sync points for whitebox crash tests |
//! | [`oracle`] | Expected-state oracle + operation traces for crash verification |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rockyardkv::{Database, DbOptions, WriteOptions};
//!
//! let db = Database::open("/tmp/mydb", DbOptions::default()).unwrap();
//!
//! db.put(b"hello", b"world", &WriteOptions::synced()).unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! db.delete(b"hello", &WriteOptions::default()).unwrap();
//! db.close().unwrap();
//! ```
//!
//! ## Durability model
//!
//! - A `sync=true` write is on stable storage when the call returns;
//!   after any crash, reopening finds it.
//! - `flush()` makes every previously acknowledged write durable
//!   independent of the WAL.
//! - Batches are atomic across crashes: all records or none.
//! - On open, the engine recovers from `CURRENT` → manifest → WAL replay,
//!   deletes orphaned tables, and arms strictly monotonic sequence
//!   numbers; no internal key is ever reused with different contents.

pub mod batch;
pub mod crashpoint;
pub mod db;
pub mod encoding;
pub mod filenames;
pub mod keys;
pub mod manifest;
pub mod memtable;
pub mod oracle;
pub mod sstable;
pub mod vfs;
pub mod wal;

pub use batch::WriteBatch;
pub use db::{
    Database, DbError, DbIterator, DbOptions, DbResult, DbStats, EventListener, ReadOptions,
    WriteOptions,
};
pub use keys::{SequenceNumber, ValueKind};
