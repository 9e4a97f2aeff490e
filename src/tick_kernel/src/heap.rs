//! Fixed arena allocator
//!
//! The arena is an array of `WORDS` words carved into a sequence of blocks.
//! Every block starts with a header recording its state and both of its
//! address neighbors together with *their* states, so that [`Arena::free`]
//! can decide which neighbors to merge with in constant time. Free blocks
//! additionally form a singly linked list sorted by address.
//!
//! Headers are stored in the arena words themselves. A used block's header
//! occupies [`USED_HEADER_WORDS`] words; a free block's header occupies
//! [`FREE_HEADER_WORDS`] words, the last of which is the free list link.
//! The payload of a used block follows its header.
//!
//! ```text
//!  word 0                                                        WORDS
//!  ┌──────┬──────────┬──────┬────────────────┬──────┬──────────────┐
//!  │ hdr  │ payload  │ hdr  │  (free)        │ hdr  │ payload      │
//!  └──────┴──────────┴──────┴────────────────┴──────┴──────────────┘
//!   Used               Free ──next_free──▶ …   Used
//! ```
//!
//! Header word encoding:
//!
//! ```text
//!  word +0   [ left block | left state | own state ]
//!  word +1   [ right block | right state | 0 ]
//!  word +2   next free block (free blocks only)
//! ```
use core::{mem::size_of, ops::Range};

use crate::error::{AllocError, FreeError};

/// The number of words a used block reserves for its header.
pub const USED_HEADER_WORDS: usize = 2;

/// The number of words a free block needs for its header. A free block is
/// never smaller than this.
pub const FREE_HEADER_WORDS: usize = 3;

const WORD_BYTES: usize = size_of::<usize>();

/// The block index field value meaning "no neighbor".
const NO_NEIGHBOR: usize = usize::MAX >> 2;

/// The free list link value meaning "end of list".
const NO_NEXT_FREE: usize = usize::MAX;

/// Refers to the payload of an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaPtr(usize);

impl ArenaPtr {
    /// Get the payload's offset in words from the start of the arena.
    pub const fn word_offset(self) -> usize {
        self.0
    }

    fn block(self) -> Option<usize> {
        self.0.checked_sub(USED_HEADER_WORDS)
    }

    pub(crate) fn add_words(self, words: usize) -> Self {
        Self(self.0 + words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Used,
}

impl BlockState {
    const fn to_bit(self) -> usize {
        match self {
            Self::Free => 0,
            Self::Used => 1,
        }
    }

    const fn from_bit(bit: usize) -> Self {
        if bit & 1 == 0 {
            Self::Free
        } else {
            Self::Used
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Neighbor {
    block: usize,
    state: BlockState,
}

/// Pack a neighbor link and one extra bit into a header word.
const fn pack_link(link: Option<Neighbor>, low: usize) -> usize {
    match link {
        Some(n) => (n.block << 2) | (n.state.to_bit() << 1) | low,
        None => (NO_NEIGHBOR << 2) | low,
    }
}

const fn unpack_link(word: usize) -> Option<Neighbor> {
    let block = word >> 2;
    if block == NO_NEIGHBOR {
        None
    } else {
        Some(Neighbor {
            block,
            state: BlockState::from_bit(word >> 1),
        })
    }
}

/// The decoded form of the first [`USED_HEADER_WORDS`] words of a block.
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    state: BlockState,
    left: Option<Neighbor>,
    right: Option<Neighbor>,
}

/// Describes a block, as yielded by [`Arena::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The first word of the block, including its header.
    pub offset: usize,
    /// The size of the block in words, including its header.
    pub words: usize,
    pub state: BlockState,
}

#[cold]
#[track_caller]
fn corrupted() -> ! {
    panic!("arena is corrupted")
}

/// An allocator managing `WORDS` words.
pub struct Arena<const WORDS: usize> {
    words: [usize; WORDS],
    free_head: Option<usize>,
}

impl<const WORDS: usize> Default for Arena<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> Arena<WORDS> {
    /// Construct an arena consisting of a single free block.
    pub const fn new() -> Self {
        let mut words = [0; WORDS];
        let mut free_head = None;
        if WORDS >= FREE_HEADER_WORDS {
            words[0] = pack_link(None, BlockState::Free.to_bit());
            words[1] = pack_link(None, 0);
            words[2] = NO_NEXT_FREE;
            free_head = Some(0);
        }
        Self { words, free_head }
    }

    #[track_caller]
    fn header(&self, block: usize) -> BlockHeader {
        match (self.words.get(block), self.words.get(block + 1)) {
            (Some(&w0), Some(&w1)) => BlockHeader {
                state: BlockState::from_bit(w0),
                left: unpack_link(w0),
                right: unpack_link(w1),
            },
            _ => corrupted(),
        }
    }

    fn write_header(&mut self, block: usize, header: BlockHeader) {
        self.words[block] = pack_link(header.left, header.state.to_bit());
        self.words[block + 1] = pack_link(header.right, 0);
    }

    fn update_header(&mut self, block: usize, f: impl FnOnce(&mut BlockHeader)) {
        let mut header = self.header(block);
        f(&mut header);
        self.write_header(block, header);
    }

    /// Get the free list link of a free block.
    fn next_free(&self, block: usize) -> Option<usize> {
        match self.words.get(block + 2) {
            Some(&NO_NEXT_FREE) => None,
            Some(&next) => Some(next),
            None => corrupted(),
        }
    }

    fn write_next_free(&mut self, block: usize, next: Option<usize>) {
        self.words[block + 2] = next.unwrap_or(NO_NEXT_FREE);
    }

    /// Get the size of a block in words.
    fn block_words(&self, block: usize) -> usize {
        match self.header(block).right {
            Some(right) => right.block - block,
            None => WORDS - block,
        }
    }

    /// Update the state of `block` and the copies of it held by its
    /// neighbors.
    fn set_state(&mut self, block: usize, state: BlockState) {
        let mut header = self.header(block);
        header.state = state;
        self.write_header(block, header);

        if let Some(left) = header.left {
            self.update_header(left.block, |h| match &mut h.right {
                Some(n) => n.state = state,
                None => corrupted(),
            });
        }
        if let Some(right) = header.right {
            self.update_header(right.block, |h| match &mut h.left {
                Some(n) => n.state = state,
                None => corrupted(),
            });
        }
    }

    /// Make `prev` (or the list head if `prev` is `None`) point to `next` in
    /// the free list.
    fn set_next_free(&mut self, prev: Option<usize>, next: Option<usize>) {
        match prev {
            Some(prev) => self.write_next_free(prev, next),
            None => self.free_head = next,
        }
    }

    /// Find the closest free block to the left of `block` by walking over its
    /// used left neighbors.
    fn prev_free(&self, block: usize) -> Option<usize> {
        let mut cursor = self.header(block).left;
        while let Some(n) = cursor {
            if n.state == BlockState::Free {
                return Some(n.block);
            }
            cursor = self.header(n.block).left;
        }
        None
    }

    /// Merge `victim` into its left neighbor `into`. The victim's header
    /// words become part of `into`.
    fn absorb(&mut self, into: usize, victim: usize) {
        let right = self.header(victim).right;
        let state = self.header(into).state;
        self.update_header(into, |h| h.right = right);
        if let Some(right) = right {
            self.update_header(right.block, |h| {
                h.left = Some(Neighbor { block: into, state })
            });
        }
    }

    /// Allocate a block with a payload of at least `bytes` bytes.
    ///
    /// The request is rounded up to a whole number of words, and the first
    /// free block that fits is used. If the rest of that block is too small
    /// to form a free block, the whole block is handed out.
    pub fn alloc(&mut self, bytes: usize) -> Result<ArenaPtr, AllocError> {
        if bytes == 0 {
            return Err(AllocError::BadParam);
        }
        let payload_words = bytes / WORD_BYTES + usize::from(bytes % WORD_BYTES != 0);
        let needed = payload_words
            .checked_add(USED_HEADER_WORDS)
            .ok_or(AllocError::OutOfMemory)?;

        let mut prev = None;
        let mut cursor = self.free_head;
        while let Some(block) = cursor {
            let header = self.header(block);
            let next = self.next_free(block);
            let size = self.block_words(block);
            if size < needed {
                prev = Some(block);
                cursor = next;
                continue;
            }

            if size - needed < FREE_HEADER_WORDS {
                self.set_next_free(prev, next);
            } else {
                // Carve the front, leaving the rest in the free list
                let rest = block + needed;
                let free_link = Some(Neighbor {
                    block: rest,
                    state: BlockState::Free,
                });
                self.write_header(
                    rest,
                    BlockHeader {
                        state: BlockState::Free,
                        left: Some(Neighbor {
                            block,
                            state: BlockState::Free,
                        }),
                        right: header.right,
                    },
                );
                self.write_next_free(rest, next);
                if let Some(right) = header.right {
                    self.update_header(right.block, |h| h.left = free_link);
                }
                self.update_header(block, |h| h.right = free_link);
                self.set_next_free(prev, Some(rest));
            }

            self.set_state(block, BlockState::Used);

            let ptr = ArenaPtr(block + USED_HEADER_WORDS);
            let end = block + self.block_words(block);
            if let Some(payload) = self.words.get_mut(ptr.0..end) {
                payload.fill(0);
            }
            log::trace!("alloc({}) = {:?}", bytes, ptr);
            return Ok(ptr);
        }

        log::debug!("alloc({}) failed: out of memory", bytes);
        Err(AllocError::OutOfMemory)
    }

    /// Release a block, merging it with free neighbors.
    pub fn free(&mut self, ptr: ArenaPtr) -> Result<(), FreeError> {
        let block = self.check_ptr(ptr)?;
        let header = self.header(block);
        let left_free = header.left.filter(|n| n.state == BlockState::Free);
        let right_free = header.right.filter(|n| n.state == BlockState::Free);

        match (left_free, right_free) {
            (None, None) => {
                let prev = self.prev_free(block);
                let next = match prev {
                    Some(prev) => self.next_free(prev),
                    None => self.free_head,
                };
                self.write_next_free(block, next);
                self.set_next_free(prev, Some(block));
                self.set_state(block, BlockState::Free);
            }
            (Some(left), None) => {
                // `left` keeps its place in the free list
                self.absorb(left.block, block);
            }
            (None, Some(right)) => {
                // `block` takes the place of `right` in the free list
                let prev = self.prev_free(block);
                let next = self.next_free(right.block);
                self.write_next_free(block, next);
                self.set_next_free(prev, Some(block));
                self.set_state(block, BlockState::Free);
                self.absorb(block, right.block);
            }
            (Some(left), Some(right)) => {
                let next = self.next_free(right.block);
                self.write_next_free(left.block, next);
                self.absorb(left.block, block);
                self.absorb(left.block, right.block);
            }
        }

        log::trace!("free({:?})", ptr);
        Ok(())
    }

    /// Get the block starting at `ptr`, which must refer to a used block.
    ///
    /// With `check_params`, the pointer is validated by walking the block
    /// chain.
    fn check_ptr(&self, ptr: ArenaPtr) -> Result<usize, FreeError> {
        let block = ptr
            .block()
            .filter(|&b| b + USED_HEADER_WORDS < WORDS)
            .ok_or(FreeError::InvalidPointer)?;
        if cfg!(feature = "check_params") {
            match self.blocks().find(|b| b.offset >= block) {
                Some(b) if b.offset == block && b.state == BlockState::Used => {}
                _ => return Err(FreeError::InvalidPointer),
            }
        } else {
            debug_assert_eq!(self.header(block).state, BlockState::Used);
        }
        Ok(block)
    }

    /// Get the payload range of the block at `ptr`. Only the header at `ptr`
    /// is consulted.
    fn payload_range(&self, ptr: ArenaPtr) -> Result<Range<usize>, FreeError> {
        let block = ptr
            .block()
            .filter(|&b| b + USED_HEADER_WORDS < WORDS)
            .ok_or(FreeError::InvalidPointer)?;
        let header = self.header(block);
        let end = header.right.map_or(WORDS, |n| n.block);
        if header.state != BlockState::Used || end <= ptr.0 || end > WORDS {
            return Err(FreeError::InvalidPointer);
        }
        Ok(ptr.0..end)
    }

    /// Get the payload of an allocated block. Its length may exceed the size
    /// passed to [`Self::alloc`].
    pub fn payload(&self, ptr: ArenaPtr) -> Result<&[usize], FreeError> {
        let range = self.payload_range(ptr)?;
        Ok(&self.words[range])
    }

    /// Get the payload of an allocated block mutably.
    pub fn payload_mut(&mut self, ptr: ArenaPtr) -> Result<&mut [usize], FreeError> {
        let range = self.payload_range(ptr)?;
        Ok(&mut self.words[range])
    }

    /// Iterate over all blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let first = (WORDS >= FREE_HEADER_WORDS).then(|| 0);
        core::iter::successors(first, move |&block| self.header(block).right.map(|n| n.block))
            .map(move |offset| BlockInfo {
                offset,
                words: self.block_words(offset),
                state: self.header(offset).state,
            })
    }

    /// Get the total size of the free blocks in bytes, headers included.
    pub fn free_bytes(&self) -> usize {
        core::iter::successors(self.free_head, |&block| self.next_free(block))
            .map(|block| self.block_words(block) * WORD_BYTES)
            .sum()
    }

    /// Get the size of the largest payload that can currently be allocated.
    pub fn max_alloc_bytes(&self) -> usize {
        core::iter::successors(self.free_head, |&block| self.next_free(block))
            .map(|block| (self.block_words(block) - USED_HEADER_WORDS) * WORD_BYTES)
            .max()
            .unwrap_or(0)
    }
}
