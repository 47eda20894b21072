//! The boundary between the cache and the storage driver.

use crate::BLOCK_SIZE;

/// Identity of one disk block: a device id and a block number on that
/// device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// Device the block lives on.
    pub dev: u32,
    /// Block number within the device.
    pub blockno: u32,
}

impl BlockId {
    /// Returns the identity of block `blockno` on device `dev`.
    pub const fn new(dev: u32, blockno: u32) -> Self {
        Self { dev, blockno }
    }
}

/// Transfer direction for [Disk::transfer].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Populate `data` from the device.
    Read,
    /// Persist `data` to the device.
    Write,
}

/// Synchronous block storage underneath the cache.
///
/// [Disk::transfer] suspends the calling thread until the device has
/// completed the request. Device failure is outside the cache's scope:
/// an implementation either succeeds or halts (panics), the analogue of
/// an unrecoverable device error stopping the kernel.
///
/// The cache calls `transfer` while holding the block's payload lock and
/// no bucket lock, so a slow device stalls only borrowers of that block.
pub trait Disk: Send + Sync {
    /// Move one block payload between memory and the device.
    fn transfer(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE], direction: Direction);
}
