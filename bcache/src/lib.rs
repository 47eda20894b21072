//! A fixed-size cache of disk block contents, shared by every core in the
//! kernel.
//!
//! Caching disk blocks in memory reduces the number of disk reads and
//! provides a synchronization point for blocks used by multiple threads:
//! only one borrower at a time can hold a block's payload, and a block
//! resident in the cache is the single in-memory copy of that block.
//!
//! # Design
//!
//! The pool of `NBUF` slots is partitioned into `NBUCKET` buckets by
//! `blockno % NBUCKET`, each bucket guarded by its own short-hold spin
//! lock so lookups on different buckets never contend. Each slot's payload
//! is guarded by a separate [sleeplock::SleepLock] that is held for the
//! whole borrow window, including storage I/O; contending borrowers park
//! instead of spinning.
//!
//! When a lookup misses, the least-recently-released slot with no
//! borrowers is evicted and re-identified. The eviction scan walks buckets
//! in ascending index order and holds at most two bucket locks at any
//! instant, which rules out lock cycles between concurrent scans.
//!
//! # Interface
//!
//! - [BlockCache::read] borrows a block, loading it from storage if the
//!   cached copy is stale.
//! - [BlockGuard::write] commits the payload to storage.
//! - Dropping the guard releases the block and marks it most recently
//!   used.
//! - [BlockGuard::pin] / [BlockCache::unpin] keep a slot resident without
//!   holding its payload lock.
//!
//! Do not hold guards longer than necessary: a slot with a live guard can
//! never be evicted, and a cache where every slot is borrowed or pinned
//! halts the kernel on the next miss.
//!
//! # Example
//!
//! ```rust
//! use osmium_bcache::{mocks::MemDisk, BlockCache, BlockId};
//!
//! let cache: BlockCache<MemDisk> = BlockCache::new(MemDisk::new());
//! let id = BlockId::new(1, 7);
//!
//! // Fill the block and commit it to storage.
//! {
//!     let mut block = cache.read(id);
//!     block[0] = 42;
//!     block.write();
//! }
//!
//! // A later borrower sees the committed payload.
//! let block = cache.read(id);
//! assert_eq!(block[0], 42);
//! ```

mod cache;
mod disk;
pub mod mocks;
pub mod sleeplock;

pub use cache::{BlockCache, BlockGuard, PinnedBlock};
pub use disk::{BlockId, Direction, Disk};

/// Size of one disk block payload in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Default number of cache slots.
pub const NBUF: usize = 30;

/// Default number of lock-partitioned buckets.
pub const NBUCKET: usize = 13;
