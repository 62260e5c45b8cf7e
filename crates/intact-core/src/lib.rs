//! Bit-rot detection and block-level deduplication for local file trees.
//!
//! A producer thread walks the tree while a pool of workers hashes files,
//! reconciles the results against the persisted per-directory indexes and
//! writes changes back through the [`store`] layer. The [`dedup`] engine
//! groups files by digest and merges identical extents through the kernel
//! where supported.

pub mod dedup;
pub mod engine;
pub mod error;
pub mod extents;
pub mod fuse;
pub mod hasher;
pub mod ignore;
pub mod index;
pub mod status;
pub mod store;

mod worker;

pub use dedup::{Dedup, DedupBag, DedupItem};
pub use engine::{Context, RunCounters};
pub use error::{Error, Result};
pub use fuse::fuse_store;
pub use hasher::HashAlgo;
pub use index::FileEntry;
pub use status::{DedupPerfEvent, LogEvent, PerfEvent, Status};
pub use store::{initialize, locate, IndexStore, StoreKind, StoreSetup};
