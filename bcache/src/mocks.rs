//! Mock implementations of the storage boundary, for testing the cache
//! and its callers.

use crate::{BlockId, Direction, Disk, BLOCK_SIZE};
use spin::Mutex;
use std::collections::HashMap;

/// An in-memory [Disk]: a map of block payloads plus per-block transfer
/// counters.
///
/// Blocks that were never written read back as zeroes. The counters let
/// tests assert whether a given borrow was served from the cache or went
/// to "the device".
#[derive(Default)]
pub struct MemDisk {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockId, [u8; BLOCK_SIZE]>,
    reads: HashMap<BlockId, u64>,
    writes: HashMap<BlockId, u64>,
}

impl MemDisk {
    /// Returns an empty disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read transfers issued for `id`.
    pub fn reads(&self, id: BlockId) -> u64 {
        self.inner.lock().reads.get(&id).copied().unwrap_or(0)
    }

    /// Number of write transfers issued for `id`.
    pub fn writes(&self, id: BlockId) -> u64 {
        self.inner.lock().writes.get(&id).copied().unwrap_or(0)
    }
}

impl Disk for MemDisk {
    fn transfer(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE], direction: Direction) {
        let mut inner = self.inner.lock();
        match direction {
            Direction::Read => {
                *inner.reads.entry(id).or_insert(0) += 1;
                match inner.blocks.get(&id) {
                    Some(block) => data.copy_from_slice(block),
                    None => data.fill(0),
                }
            }
            Direction::Write => {
                *inner.writes.entry(id).or_insert(0) += 1;
                inner.blocks.insert(id, *data);
            }
        }
    }
}
