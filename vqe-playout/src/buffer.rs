//! Loaded playout buffers.
//!
//! [`BufferRegistry`] ties a buffer index (from a [`SlotAllocator`]) to a
//! block of external memory (from a [`MemoryArena`]) and remembers what the
//! playout side needs to build events: size, address and PCM law. It also
//! counts the ports still referencing each buffer so that memory the
//! hardware may read is never handed back.

use alloc::vec;
use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::arena::MemoryArena;
use crate::bus::{Device, DeviceBus};
use crate::config::ArenaRegion;
use crate::constants::{ARENA_GRANULARITY, BUFFER_SIZE_GRANULARITY, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::error::{PlayoutError, Result};
use crate::slot::SlotAllocator;

/// Companding law of the samples in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcmLaw {
    #[default]
    ULaw = 0,
    ALaw = 1,
}

impl TryFrom<u32> for PcmLaw {
    type Error = u32;

    fn try_from(value: u32) -> core::result::Result<Self, u32> {
        match value {
            0 => Ok(PcmLaw::ULaw),
            1 => Ok(PcmLaw::ALaw),
            other => Err(other),
        }
    }
}

/// Book-keeping for one buffer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub reserved: bool,
    /// Size in bytes as loaded (not rounded).
    pub size: u32,
    /// Start of the buffer in external memory.
    pub base_address: u32,
    pub law: PcmLaw,
    /// Number of port references that keep the buffer loaded.
    pub dependency_count: u16,
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedBuffer {
    pub index: u32,
    /// Free playout memory after the load, ignoring fragmentation.
    pub free_memory: u32,
}

/// Memory statistics of the loaded buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub buffers_loaded: u32,
    /// Bytes in use, each buffer rounded up to the arena granularity.
    pub bytes_used: u32,
    /// Bytes not in use, ignoring fragmentation.
    pub free_memory: u32,
}

/// Loaded buffers and the memory behind them.
pub struct BufferRegistry {
    slots: SlotAllocator,
    arena: MemoryArena,
    descriptors: Vec<BufferDescriptor>,
    bytes_used: u32,
}

impl BufferRegistry {
    pub fn new(max_buffers: u32, memory: ArenaRegion) -> Self {
        BufferRegistry {
            slots: SlotAllocator::new(max_buffers),
            arena: MemoryArena::new(memory.base, memory.size, max_buffers),
            descriptors: vec![BufferDescriptor::default(); max_buffers as usize],
            bytes_used: 0,
        }
    }

    /// Load `size` bytes of `pattern` into a new buffer.
    pub fn load<B, D>(
        &mut self,
        dev: &mut Device<B, D>,
        pattern: &[u8],
        size: u32,
        law: PcmLaw,
    ) -> Result<LoadedBuffer, B::Error>
    where
        B: DeviceBus,
        D: DelayNs,
    {
        check_size::<B::Error>(size)?;
        if pattern.len() < size as usize {
            return Err(PlayoutError::PatternMissing);
        }
        let (index, base) = self.reserve::<B::Error>(size)?;
        if let Err(err) = dev.write_bytes(base, &pattern[..size as usize]) {
            self.rollback(index, base);
            return Err(err);
        }
        Ok(self.commit(index, base, size, law))
    }

    /// Reserve a buffer of `size` bytes without writing its contents.
    ///
    /// The contents are supplied afterwards with [`load_block`](Self::load_block).
    pub fn load_block_init<E>(&mut self, size: u32, law: PcmLaw) -> Result<LoadedBuffer, E> {
        check_size::<E>(size)?;
        let (index, base) = self.reserve::<E>(size)?;
        Ok(self.commit(index, base, size, law))
    }

    /// Write `data` at byte `offset` of a buffer reserved by
    /// [`load_block_init`](Self::load_block_init) (or a full load).
    pub fn load_block<B, D>(
        &mut self,
        dev: &mut Device<B, D>,
        index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), B::Error>
    where
        B: DeviceBus,
        D: DelayNs,
    {
        let desc = *self.descriptor::<B::Error>(index)?;
        let length = data.len() as u32;
        if offset % 2 != 0 {
            return Err(PlayoutError::BlockOffsetOdd(offset));
        }
        if length % 2 != 0 {
            return Err(PlayoutError::BlockLengthOdd(length));
        }
        if offset.checked_add(length).map_or(true, |end| end > desc.size) {
            return Err(PlayoutError::BlockOutOfBounds {
                offset,
                length,
                size: desc.size,
            });
        }
        dev.write_bytes(desc.base_address + offset, data)
    }

    /// Unload a buffer and free its memory.
    pub fn unload<E>(&mut self, index: u32) -> Result<(), E> {
        let desc = *self.descriptor::<E>(index)?;
        if desc.dependency_count != 0 {
            log::warn!(
                "buffer {} still has {} dependencies",
                index,
                desc.dependency_count
            );
            return Err(PlayoutError::ActiveDependencies(index));
        }
        self.arena.release(desc.base_address)?;
        self.slots.release(index)?;
        self.descriptors[index as usize] = BufferDescriptor::default();
        self.bytes_used -= rounded(desc.size);
        log::debug!("unloaded buffer {} ({} bytes)", index, desc.size);
        Ok(())
    }

    /// Descriptor of a loaded buffer.
    pub fn descriptor<E>(&self, index: u32) -> Result<&BufferDescriptor, E> {
        let desc = self
            .descriptors
            .get(index as usize)
            .ok_or(PlayoutError::<E>::BufferIndexOutOfRange(index))?;
        if !desc.reserved {
            return Err(PlayoutError::BufferNotOpen(index));
        }
        Ok(desc)
    }

    /// Record one more port reference to `index`.
    pub(crate) fn add_dependency<E>(&mut self, index: u32) -> Result<(), E> {
        self.descriptor::<E>(index)?;
        let desc = &mut self.descriptors[index as usize];
        desc.dependency_count = desc.dependency_count.saturating_add(1);
        Ok(())
    }

    /// Drop one port reference to `index`.
    pub(crate) fn drop_dependency(&mut self, index: u32) {
        if let Some(desc) = self.descriptors.get_mut(index as usize) {
            desc.dependency_count = desc.dependency_count.saturating_sub(1);
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffers_loaded: self.slots.allocated_count(),
            bytes_used: self.bytes_used,
            free_memory: self.arena.total_bytes() - self.bytes_used,
        }
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    // ── Private helpers ────────────────────────────────────────────────

    fn reserve<E>(&mut self, size: u32) -> Result<(u32, u32), E> {
        let index = self.slots.reserve()?;
        match self.arena.reserve(size) {
            Ok(base) => Ok((index, base)),
            Err(err) => {
                self.slots.release(index)?;
                Err(err.into())
            }
        }
    }

    fn rollback(&mut self, index: u32, base: u32) {
        if let Err(err) = self.arena.release(base) {
            log::error!("rollback of buffer {}: {}", index, err);
        }
        if let Err(err) = self.slots.release(index) {
            log::error!("rollback of buffer {}: {}", index, err);
        }
    }

    fn commit(&mut self, index: u32, base: u32, size: u32, law: PcmLaw) -> LoadedBuffer {
        self.descriptors[index as usize] = BufferDescriptor {
            reserved: true,
            size,
            base_address: base,
            law,
            dependency_count: 0,
        };
        self.bytes_used += rounded(size);
        log::debug!("loaded buffer {} ({} bytes at {:#x})", index, size, base);
        LoadedBuffer {
            index,
            free_memory: self.stats().free_memory,
        }
    }
}

fn check_size<E>(size: u32) -> Result<(), E> {
    if size < MIN_BUFFER_SIZE {
        return Err(PlayoutError::BufferSizeTooSmall(size));
    }
    if size % BUFFER_SIZE_GRANULARITY != 0 {
        return Err(PlayoutError::BufferSizeNotAligned(size));
    }
    if size > MAX_BUFFER_SIZE {
        return Err(PlayoutError::BufferSizeTooLarge(size));
    }
    Ok(())
}

fn rounded(size: u32) -> u32 {
    size.div_ceil(ARENA_GRANULARITY) * ARENA_GRANULARITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBus, MockDelay, MockError, MEMORY_BASE};

    type Dev = Device<MockBus, MockDelay>;

    fn setup(max: u32, size: u32) -> (BufferRegistry, Dev) {
        let reg = BufferRegistry::new(max, ArenaRegion { base: MEMORY_BASE, size });
        (reg, Device::new(MockBus::new(), MockDelay::default()))
    }

    #[test]
    fn load_writes_pattern_and_tracks_usage() {
        let (mut reg, mut dev) = setup(4, 4096);
        let pattern: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
        let loaded = reg.load(&mut dev, &pattern, 128, PcmLaw::ALaw).unwrap();

        let desc = *reg.descriptor::<MockError>(loaded.index).unwrap();
        assert!(desc.reserved);
        assert_eq!(desc.size, 128);
        assert_eq!(desc.law, PcmLaw::ALaw);
        assert_eq!(dev.bus().word(desc.base_address), 0x0001);
        assert_eq!(dev.bus().word(desc.base_address + 126), 0x7E7F);
        assert_eq!(loaded.free_memory, 4096 - 128);
    }

    #[test]
    fn usage_is_rounded_to_arena_granularity() {
        let (mut reg, mut dev) = setup(4, 4096);
        let pattern = [0u8; 80];
        let loaded = reg.load(&mut dev, &pattern, 80, PcmLaw::ULaw).unwrap();
        assert_eq!(loaded.free_memory, 4096 - 128);
        assert_eq!(reg.stats().bytes_used, 128);
    }

    #[test]
    fn size_validation() {
        let (mut reg, _) = setup(4, 4096);
        assert!(matches!(
            reg.load_block_init::<MockError>(32, PcmLaw::ULaw),
            Err(PlayoutError::BufferSizeTooSmall(32))
        ));
        assert!(matches!(
            reg.load_block_init::<MockError>(72, PcmLaw::ULaw),
            Err(PlayoutError::BufferSizeNotAligned(72))
        ));
        assert!(matches!(
            reg.load_block_init::<MockError>(MAX_BUFFER_SIZE + 16, PcmLaw::ULaw),
            Err(PlayoutError::BufferSizeTooLarge(_))
        ));
        assert_eq!(reg.stats().buffers_loaded, 0);
    }

    #[test]
    fn short_pattern_is_rejected() {
        let (mut reg, mut dev) = setup(4, 4096);
        let pattern = [0u8; 64];
        assert!(matches!(
            reg.load(&mut dev, &pattern, 128, PcmLaw::ULaw),
            Err(PlayoutError::PatternMissing)
        ));
    }

    #[test]
    fn out_of_memory_releases_slot() {
        let (mut reg, _) = setup(4, 256);
        reg.load_block_init::<MockError>(256, PcmLaw::ULaw).unwrap();
        assert!(matches!(
            reg.load_block_init::<MockError>(64, PcmLaw::ULaw),
            Err(PlayoutError::OutOfMemory(64))
        ));
        assert_eq!(reg.stats().buffers_loaded, 1);
    }

    #[test]
    fn slot_exhaustion() {
        let (mut reg, _) = setup(2, 4096);
        reg.load_block_init::<MockError>(64, PcmLaw::ULaw).unwrap();
        reg.load_block_init::<MockError>(64, PcmLaw::ULaw).unwrap();
        assert!(matches!(
            reg.load_block_init::<MockError>(64, PcmLaw::ULaw),
            Err(PlayoutError::AllBuffersOpen)
        ));
    }

    #[test]
    fn bus_failure_during_load_rolls_back() {
        let (mut reg, mut dev) = setup(4, 4096);
        dev.bus_mut().fail = true;
        let pattern = [0u8; 64];
        assert!(matches!(
            reg.load(&mut dev, &pattern, 64, PcmLaw::ULaw),
            Err(PlayoutError::Bus(MockError))
        ));
        assert_eq!(reg.stats().buffers_loaded, 0);
        assert_eq!(reg.arena().free_bytes(), 4096);
    }

    #[test]
    fn repeated_rollback_is_reported_not_fatal() {
        let (mut reg, _) = setup(4, 4096);
        let (index, base) = reg.reserve::<MockError>(64).unwrap();
        reg.rollback(index, base);
        reg.rollback(index, base);
        assert_eq!(reg.stats().buffers_loaded, 0);
        assert_eq!(reg.arena().free_bytes(), 4096);
    }

    #[test]
    fn block_load_builds_buffer_incrementally() {
        let (mut reg, mut dev) = setup(4, 4096);
        let loaded = reg.load_block_init::<MockError>(256, PcmLaw::ULaw).unwrap();
        let base = reg.descriptor::<MockError>(loaded.index).unwrap().base_address;

        reg.load_block(&mut dev, loaded.index, 0, &[0xAA; 128]).unwrap();
        reg.load_block(&mut dev, loaded.index, 128, &[0x55; 128]).unwrap();
        assert_eq!(dev.bus().word(base), 0xAAAA);
        assert_eq!(dev.bus().word(base + 254), 0x5555);
    }

    #[test]
    fn block_load_validation() {
        let (mut reg, mut dev) = setup(4, 4096);
        let idx = reg.load_block_init::<MockError>(128, PcmLaw::ULaw).unwrap().index;
        assert!(matches!(
            reg.load_block(&mut dev, idx, 1, &[0; 2]),
            Err(PlayoutError::BlockOffsetOdd(1))
        ));
        assert!(matches!(
            reg.load_block(&mut dev, idx, 0, &[0; 3]),
            Err(PlayoutError::BlockLengthOdd(3))
        ));
        assert!(matches!(
            reg.load_block(&mut dev, idx, 64, &[0; 80]),
            Err(PlayoutError::BlockOutOfBounds { offset: 64, length: 80, size: 128 })
        ));
        assert!(matches!(
            reg.load_block(&mut dev, 9, 0, &[0; 2]),
            Err(PlayoutError::BufferIndexOutOfRange(9))
        ));
        assert!(matches!(
            reg.load_block(&mut dev, (idx + 1) % 4, 0, &[0; 2]),
            Err(PlayoutError::BufferNotOpen(_))
        ));
    }

    #[test]
    fn unload_restores_memory() {
        let (mut reg, _) = setup(4, 4096);
        let before = reg.stats();
        let idx = reg.load_block_init::<MockError>(192, PcmLaw::ULaw).unwrap().index;
        reg.unload::<MockError>(idx).unwrap();
        assert_eq!(reg.stats(), before);
        assert_eq!(reg.arena().node_count(), 1);
        assert!(matches!(
            reg.unload::<MockError>(idx),
            Err(PlayoutError::BufferNotOpen(_))
        ));
    }

    #[test]
    fn unload_with_dependencies_fails() {
        let (mut reg, _) = setup(4, 4096);
        let idx = reg.load_block_init::<MockError>(64, PcmLaw::ULaw).unwrap().index;
        reg.add_dependency::<MockError>(idx).unwrap();
        assert!(matches!(
            reg.unload::<MockError>(idx),
            Err(PlayoutError::ActiveDependencies(_))
        ));
        reg.drop_dependency(idx);
        reg.unload::<MockError>(idx).unwrap();
    }

    #[test]
    fn law_from_raw_value() {
        assert_eq!(PcmLaw::try_from(0), Ok(PcmLaw::ULaw));
        assert_eq!(PcmLaw::try_from(1), Ok(PcmLaw::ALaw));
        assert_eq!(PcmLaw::try_from(7), Err(7));
    }
}
