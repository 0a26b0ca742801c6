//! External-memory arena for playout buffers.
//!
//! The arena hands out byte ranges of a single contiguous region of chip
//! memory. It never touches the memory itself; it only keeps the books.
//!
//! ## Layout
//!
//! Bookkeeping lives in a fixed pool of [`ArenaNode`]s addressed by index.
//! Nodes in use form a doubly linked ring in address order that covers the
//! whole region; node 0 always starts at the region base. Spare nodes are
//! chained through `next` on a separate singly linked list.
//!
//! ```text
//!   ring:   [0: 0x000 alloc] <-> [3: 0x400 free] <-> [1: 0x800 alloc] <-> (back to 0)
//!   unused: 2 -> 4 -> 5 -> NIL
//! ```
//!
//! Allocation is first-fit starting at a roving cursor. A non-exact fit
//! borrows a spare node for the remainder; release coalesces with free
//! neighbours and returns the absorbed node to the spare list.

use alloc::vec::Vec;

use thiserror::Error;

use crate::constants::ARENA_GRANULARITY;
use crate::error::{FatalError, PlayoutError};

const NIL: u32 = u32::MAX;

/// Failure of a [`MemoryArena`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// Zero-byte reservations are not allowed.
    #[error("zero-sized reservation")]
    ZeroSize,
    /// No free block is large enough.
    #[error("no free block of {0} bytes")]
    OutOfMemory(u32),
    /// No allocated block starts at the given address.
    #[error("no allocated block at {0:#x}")]
    NotFound(u32),
    /// The spare-node pool ran dry while splitting.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl<E> From<ArenaError> for PlayoutError<E> {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::ZeroSize => PlayoutError::BufferSizeTooSmall(0),
            ArenaError::OutOfMemory(size) => PlayoutError::OutOfMemory(size),
            ArenaError::NotFound(address) => {
                log::error!("arena has no allocated block at {:#x}", address);
                PlayoutError::Fatal(FatalError::ArenaCorrupted)
            }
            ArenaError::Fatal(fatal) => PlayoutError::Fatal(fatal),
        }
    }
}

/// One bookkeeping record of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaNode {
    pub size: u32,
    pub start_address: u32,
    pub next: u32,
    pub previous: u32,
    pub allocated: bool,
}

impl ArenaNode {
    const fn spare(next: u32) -> Self {
        ArenaNode {
            size: 0,
            start_address: 0,
            next,
            previous: NIL,
            allocated: false,
        }
    }
}

/// A block of the arena as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBlock {
    pub start_address: u32,
    pub size: u32,
    pub allocated: bool,
}

/// First-fit allocator over a contiguous external-memory region.
pub struct MemoryArena {
    nodes: Vec<ArenaNode>,
    /// Head of the spare-node list.
    unused: u32,
    /// Node where the next search begins.
    rover: u32,
    base: u32,
    size: u32,
    allocated_bytes: u32,
}

impl MemoryArena {
    /// Create an arena over `[base, base + size)` able to track `max_blocks`
    /// simultaneous allocations.
    ///
    /// The node pool holds `2 * max_blocks` nodes plus node 0, which is
    /// enough for every allocation to be separated from the next by a free
    /// block.
    pub fn new(base: u32, size: u32, max_blocks: u32) -> Self {
        let pool = 2 * max_blocks as usize + 1;
        let mut nodes = Vec::with_capacity(pool);
        nodes.push(ArenaNode {
            size,
            start_address: base,
            next: 0,
            previous: 0,
            allocated: false,
        });
        for i in 1..pool {
            let next = if i + 1 < pool { (i + 1) as u32 } else { NIL };
            nodes.push(ArenaNode::spare(next));
        }
        MemoryArena {
            nodes,
            unused: if pool > 1 { 1 } else { NIL },
            rover: 0,
            base,
            size,
            allocated_bytes: 0,
        }
    }

    /// Reserve `size` bytes (rounded up to [`ARENA_GRANULARITY`]) and return
    /// the block's start address.
    pub fn reserve(&mut self, size: u32) -> Result<u32, ArenaError> {
        if size == 0 {
            return Err(ArenaError::ZeroSize);
        }
        let size = round_up(size).ok_or(ArenaError::OutOfMemory(size))?;

        let start = self.rover;
        let mut index = start;
        let found = loop {
            let node = &self.nodes[index as usize];
            if !node.allocated && node.size >= size {
                break Some(index);
            }
            index = node.next;
            if index == start {
                break None;
            }
        };
        let index = found.ok_or(ArenaError::OutOfMemory(size))?;

        if self.nodes[index as usize].size != size {
            let spare = self.take_spare()?;
            let node = self.nodes[index as usize];
            let after = node.next;
            self.nodes[spare as usize] = ArenaNode {
                size: node.size - size,
                start_address: node.start_address + size,
                next: after,
                previous: index,
                allocated: false,
            };
            self.nodes[after as usize].previous = spare;
            let node = &mut self.nodes[index as usize];
            node.next = spare;
            node.size = size;
        }

        let node = &mut self.nodes[index as usize];
        node.allocated = true;
        self.rover = index;
        self.allocated_bytes += size;
        Ok(node.start_address)
    }

    /// Release the block that starts at `address`, merging it with free
    /// neighbours.
    pub fn release(&mut self, address: u32) -> Result<(), ArenaError> {
        let index = self
            .ring()
            .find(|&i| {
                let n = &self.nodes[i as usize];
                n.allocated && n.start_address == address
            })
            .ok_or(ArenaError::NotFound(address))?;

        let node = &mut self.nodes[index as usize];
        node.allocated = false;
        self.allocated_bytes -= node.size;

        let next = node.next;
        if self.is_free_neighbour(index, next) {
            self.absorb(index, next);
        }
        let previous = self.nodes[index as usize].previous;
        if self.is_free_neighbour(previous, index) {
            self.absorb(previous, index);
        }
        Ok(())
    }

    /// Bytes currently reserved (in granularity units).
    pub fn used_bytes(&self) -> u32 {
        self.allocated_bytes
    }

    /// Bytes not reserved, regardless of fragmentation.
    pub fn free_bytes(&self) -> u32 {
        self.size - self.allocated_bytes
    }

    /// Total size of the region.
    pub fn total_bytes(&self) -> u32 {
        self.size
    }

    /// First address of the region.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Size of the largest free block.
    pub fn largest_free_block(&self) -> u32 {
        self.blocks()
            .filter(|b| !b.allocated)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Number of nodes currently linked in the ring.
    pub fn node_count(&self) -> usize {
        self.ring().count()
    }

    /// Blocks in address order, starting at the region base.
    pub fn blocks(&self) -> impl Iterator<Item = ArenaBlock> + '_ {
        self.ring().map(move |i| {
            let n = &self.nodes[i as usize];
            ArenaBlock {
                start_address: n.start_address,
                size: n.size,
                allocated: n.allocated,
            }
        })
    }

    // ── Private helpers ────────────────────────────────────────────────

    fn ring(&self) -> impl Iterator<Item = u32> + '_ {
        let mut index = Some(0u32);
        core::iter::from_fn(move || {
            let current = index?;
            let next = self.nodes[current as usize].next;
            index = if next == 0 { None } else { Some(next) };
            Some(current)
        })
    }

    fn take_spare(&mut self) -> Result<u32, ArenaError> {
        if self.unused == NIL {
            log::error!("arena node pool exhausted ({} nodes)", self.nodes.len());
            return Err(FatalError::NodePoolExhausted.into());
        }
        let spare = self.unused;
        self.unused = self.nodes[spare as usize].next;
        Ok(spare)
    }

    fn give_back(&mut self, index: u32) {
        self.nodes[index as usize] = ArenaNode::spare(self.unused);
        self.unused = index;
    }

    /// `second` directly follows `first` in memory and both are free.
    fn is_free_neighbour(&self, first: u32, second: u32) -> bool {
        if first == second {
            return false;
        }
        let a = &self.nodes[first as usize];
        let b = &self.nodes[second as usize];
        !a.allocated && !b.allocated && a.start_address + a.size == b.start_address
    }

    /// Merge `second` into `first` and return `second` to the spare list.
    fn absorb(&mut self, first: u32, second: u32) {
        let removed = self.nodes[second as usize];
        let after = removed.next;
        let keep = &mut self.nodes[first as usize];
        keep.size += removed.size;
        keep.next = after;
        self.nodes[after as usize].previous = first;
        if self.rover == second {
            self.rover = first;
        }
        self.give_back(second);
    }
}

fn round_up(size: u32) -> Option<u32> {
    let g = ARENA_GRANULARITY;
    size.checked_add(g - 1).map(|s| s / g * g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use proptest::prelude::*;

    const BASE: u32 = 0x1000;

    fn layout(arena: &MemoryArena) -> Vec<ArenaBlock> {
        arena.blocks().collect()
    }

    fn check_conservation(arena: &MemoryArena) {
        let blocks = layout(arena);
        let allocated: u32 = blocks.iter().filter(|b| b.allocated).map(|b| b.size).sum();
        let free: u32 = blocks.iter().filter(|b| !b.allocated).map(|b| b.size).sum();
        assert_eq!(allocated + free, arena.total_bytes());
        assert_eq!(allocated, arena.used_bytes());
        // Contiguous, address ordered, no two free neighbours.
        let mut expected = arena.base();
        for pair in blocks.windows(2) {
            assert!(pair[0].allocated || pair[1].allocated, "free neighbours left unmerged");
        }
        for b in &blocks {
            assert_eq!(b.start_address, expected);
            expected += b.size;
        }
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let arena = MemoryArena::new(BASE, 4096, 4);
        assert_eq!(
            layout(&arena),
            vec![ArenaBlock { start_address: BASE, size: 4096, allocated: false }]
        );
        assert_eq!(arena.free_bytes(), 4096);
    }

    #[test]
    fn reserve_rounds_to_granularity() {
        let mut arena = MemoryArena::new(BASE, 4096, 4);
        let a = arena.reserve(100).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(arena.used_bytes(), 128);
        let b = arena.reserve(64).unwrap();
        assert_eq!(b, BASE + 128);
        check_conservation(&arena);
    }

    #[test]
    fn reserve_zero_fails() {
        let mut arena = MemoryArena::new(BASE, 4096, 4);
        assert_eq!(arena.reserve(0), Err(ArenaError::ZeroSize));
    }

    #[test]
    fn oversize_reserve_leaves_state_untouched() {
        let mut arena = MemoryArena::new(BASE, 1024, 4);
        arena.reserve(512).unwrap();
        let before = layout(&arena);
        assert_eq!(arena.reserve(1024), Err(ArenaError::OutOfMemory(1024)));
        assert_eq!(arena.reserve(u32::MAX), Err(ArenaError::OutOfMemory(u32::MAX)));
        assert_eq!(layout(&arena), before);
    }

    #[test]
    fn exact_fit_does_not_split() {
        let mut arena = MemoryArena::new(BASE, 1024, 4);
        arena.reserve(1024).unwrap();
        assert_eq!(arena.node_count(), 1);
        assert_eq!(arena.free_bytes(), 0);
        assert_eq!(arena.reserve(64), Err(ArenaError::OutOfMemory(64)));
    }

    #[test]
    fn release_coalesces_both_sides() {
        let mut arena = MemoryArena::new(BASE, 1024, 4);
        let a = arena.reserve(256).unwrap();
        let b = arena.reserve(256).unwrap();
        let c = arena.reserve(256).unwrap();
        assert_eq!(arena.node_count(), 4);

        arena.release(a).unwrap();
        arena.release(c).unwrap();
        check_conservation(&arena);
        assert_eq!(arena.node_count(), 3);

        arena.release(b).unwrap();
        assert_eq!(arena.node_count(), 1);
        assert_eq!(arena.largest_free_block(), 1024);
    }

    #[test]
    fn release_unknown_address_fails() {
        let mut arena = MemoryArena::new(BASE, 1024, 4);
        let a = arena.reserve(64).unwrap();
        assert_eq!(arena.release(a + 64), Err(ArenaError::NotFound(a + 64)));
        arena.release(a).unwrap();
        assert_eq!(arena.release(a), Err(ArenaError::NotFound(a)));
    }

    #[test]
    fn first_fit_from_rover_reuses_hole() {
        let mut arena = MemoryArena::new(BASE, 1024, 4);
        let a = arena.reserve(128).unwrap();
        let _b = arena.reserve(128).unwrap();
        arena.release(a).unwrap();
        // Rover sits past the hole; the scan wraps around to find it once
        // the tail is exhausted.
        let tail = arena.reserve(768).unwrap();
        assert_eq!(tail, BASE + 256);
        assert_eq!(arena.reserve(128).unwrap(), a);
        check_conservation(&arena);
    }

    #[test]
    fn pool_covers_worst_case_fragmentation() {
        let max = 8;
        let mut arena = MemoryArena::new(BASE, 64 * 16, max);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(arena.reserve(64).unwrap());
        }
        // Free every other block so allocated and free blocks alternate.
        for a in held.iter().step_by(2) {
            arena.release(*a).unwrap();
        }
        check_conservation(&arena);
        assert!(arena.node_count() <= 2 * max as usize + 1);
    }

    #[test]
    fn exhausted_node_pool_is_fatal() {
        let mut arena = MemoryArena::new(BASE, 1024, 0);
        assert_eq!(
            arena.reserve(64),
            Err(ArenaError::Fatal(FatalError::NodePoolExhausted))
        );
        // Exact fit needs no spare node.
        assert_eq!(arena.reserve(1024), Ok(BASE));
    }

    proptest! {
        #[test]
        fn conservation_holds_for_any_sequence(
            ops in proptest::collection::vec((any::<bool>(), 1u32..6, any::<prop::sample::Index>()), 1..64)
        ) {
            let mut arena = MemoryArena::new(BASE, 64 * 32, 16);
            let mut held: Vec<u32> = Vec::new();
            for (reserve, units, pick) in ops {
                if reserve || held.is_empty() {
                    if held.len() < 16 {
                        if let Ok(a) = arena.reserve(units * 64) {
                            held.push(a);
                        }
                    }
                } else {
                    let a = held.swap_remove(pick.index(held.len()));
                    prop_assert!(arena.release(a).is_ok());
                }
                check_conservation(&arena);
            }
        }

        #[test]
        fn reserve_then_release_restores_layout(
            prefix in proptest::collection::vec(1u32..4, 0..8),
            units in 1u32..8,
        ) {
            let mut arena = MemoryArena::new(BASE, 64 * 64, 16);
            for u in prefix {
                arena.reserve(u * 64).unwrap();
            }
            let before = layout(&arena);
            let count = arena.node_count();
            if let Ok(a) = arena.reserve(units * 64) {
                arena.release(a).unwrap();
            }
            prop_assert_eq!(layout(&arena), before);
            prop_assert_eq!(arena.node_count(), count);
        }
    }
}
