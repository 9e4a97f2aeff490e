//! Memory partitions
//!
//! A partition is a pool of equally sized blocks carved out of one arena
//! allocation. Unused blocks are chained through their first word.
use core::mem::size_of;

use crate::{
    error::{BadIdError, CreatePartitionError, FreeBlockError, GetBlockError, PartitionError},
    heap::ArenaPtr,
    utils::Init,
    Kernel, Port,
};

/// The capacity of the partition table.
pub const MAX_PARTITIONS: usize = 4;

/// Marks the end of a partition's free list.
const NO_BLOCK: usize = usize::MAX;

/// Identifies a memory partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(usize);

impl PartitionId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PartitionCb {
    storage: ArenaPtr,
    block_words: usize,
    block_count: usize,
    /// The index of the first unused block.
    free_head: Option<usize>,
    free_count: usize,
}

#[derive(Debug)]
pub(crate) struct PartitionTable {
    cbs: [Option<PartitionCb>; MAX_PARTITIONS],
}

impl Init for PartitionTable {
    const INIT: Self = Self {
        cbs: [None; MAX_PARTITIONS],
    };
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_partition(&self, id: PartitionId) -> Result<PartitionCb, BadIdError> {
        if cfg!(feature = "check_params") {
            match self.partitions.cbs.get(id.0) {
                Some(Some(cb)) => Ok(*cb),
                _ => Err(BadIdError::InvalidId),
            }
        } else {
            let cb = self.partitions.cbs[id.0];
            debug_assert!(cb.is_some(), "invalid partition {:?}", id);
            cb.ok_or(BadIdError::InvalidId)
        }
    }

    /// Create a partition of `block_count` blocks of `block_words` words
    /// each.
    pub fn create_partition(
        &mut self,
        block_words: usize,
        block_count: usize,
    ) -> Result<PartitionId, CreatePartitionError> {
        if block_words == 0 || block_count < 2 {
            return Err(CreatePartitionError::BadParam);
        }
        let bytes = block_words
            .checked_mul(block_count)
            .and_then(|words| words.checked_mul(size_of::<usize>()))
            .ok_or(CreatePartitionError::OutOfMemory)?;

        self.with_cpu_lock(|k| {
            let i = k
                .partitions
                .cbs
                .iter()
                .position(Option::is_none)
                .ok_or(CreatePartitionError::Exhausted)?;
            let storage = k.heap.alloc(bytes)?;

            // Chain every block
            if let Ok(words) = k.heap.payload_mut(storage) {
                for block in 0..block_count {
                    words[block * block_words] = if block + 1 < block_count {
                        block + 1
                    } else {
                        NO_BLOCK
                    };
                }
            }

            k.partitions.cbs[i] = Some(PartitionCb {
                storage,
                block_words,
                block_count,
                free_head: Some(0),
                free_count: block_count,
            });
            log::trace!(
                "created partition {}: {} x {} words at {:?}",
                i,
                block_count,
                block_words,
                storage
            );
            Ok(PartitionId(i))
        })
    }

    /// Delete a partition and return its storage to the arena. Blocks still
    /// in use become invalid.
    pub fn delete_partition(&mut self, id: PartitionId) -> Result<(), PartitionError> {
        self.with_cpu_lock(|k| {
            let cb = k.check_partition(id)?;
            k.partitions.cbs[id.0] = None;
            let result = k.heap.free(cb.storage);
            debug_assert!(result.is_ok());
            Ok(())
        })
    }

    /// Take an unused block.
    pub fn get_block(&mut self, id: PartitionId) -> Result<ArenaPtr, GetBlockError> {
        self.with_cpu_lock(|k| {
            let mut cb = k.check_partition(id)?;
            let block = cb.free_head.ok_or(GetBlockError::Exhausted)?;

            let next = k
                .heap
                .payload(cb.storage)
                .map(|words| words[block * cb.block_words])
                .unwrap_or(NO_BLOCK);
            cb.free_head = (next != NO_BLOCK).then(|| next);
            cb.free_count -= 1;
            k.partitions.cbs[id.0] = Some(cb);

            Ok(cb.storage.add_words(block * cb.block_words))
        })
    }

    /// Return a block to its partition.
    pub fn free_block(&mut self, id: PartitionId, ptr: ArenaPtr) -> Result<(), FreeBlockError> {
        self.with_cpu_lock(|k| {
            let mut cb = k.check_partition(id)?;

            let offset = ptr
                .word_offset()
                .checked_sub(cb.storage.word_offset())
                .ok_or(FreeBlockError::InvalidPointer)?;
            if offset % cb.block_words != 0 || offset / cb.block_words >= cb.block_count {
                return Err(FreeBlockError::InvalidPointer);
            }
            let block = offset / cb.block_words;

            if cfg!(feature = "check_params") && k.is_free_block(&cb, block) {
                return Err(FreeBlockError::InvalidPointer);
            }

            if let Ok(words) = k.heap.payload_mut(cb.storage) {
                words[offset] = cb.free_head.unwrap_or(NO_BLOCK);
            }
            cb.free_head = Some(block);
            cb.free_count += 1;
            k.partitions.cbs[id.0] = Some(cb);
            Ok(())
        })
    }

    /// Get the number of unused blocks in a partition.
    pub fn free_block_count(&self, id: PartitionId) -> Result<usize, PartitionError> {
        Ok(self.check_partition(id)?.free_count)
    }

    /// Determine whether `block` is in the free list of a partition.
    fn is_free_block(&self, cb: &PartitionCb, block: usize) -> bool {
        let Ok(words) = self.heap.payload(cb.storage) else {
            return false;
        };
        let mut cursor = cb.free_head;
        // Bounded in case the chain was corrupted by the application
        for _ in 0..cb.block_count {
            match cursor {
                Some(i) if i == block => return true,
                Some(i) => {
                    let next = words[i * cb.block_words];
                    cursor = (next != NO_BLOCK).then(|| next);
                }
                None => break,
            }
        }
        false
    }
}
