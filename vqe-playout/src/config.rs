//! Configuration of the playout subsystem.

use crate::constants::{ARENA_GRANULARITY, ADDRESS_MASK};
use crate::memory_map::PlayoutMemoryMap;

/// Chip image capability that decides the event ring layout and how queued
/// events are skipped on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant {
    /// 31-event ring; skipping is driven by per-port configuration bits and a
    /// skip pointer.
    Legacy,
    /// 127-event ring; every event carries its own skip and hard-skip bits.
    Extended,
}

impl ImageVariant {
    /// Number of event slots in the ring. Pointers are taken modulo this.
    pub const fn ring_slots(self) -> u32 {
        match self {
            ImageVariant::Legacy => 32,
            ImageVariant::Extended => 128,
        }
    }

    /// Number of events that can be queued at once.
    pub const fn event_capacity(self) -> u32 {
        self.ring_slots() - 1
    }

    /// Whether events carry their own skip bits.
    pub const fn per_event_skip(self) -> bool {
        matches!(self, ImageVariant::Extended)
    }
}

/// Region of external memory reserved for buffer storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRegion {
    pub base: u32,
    pub size: u32,
}

/// Bound on hardware drain polling.
///
/// Exceeding `max_attempts` reads is fatal: it means the chip stopped
/// advancing its read pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    /// Delay between two reads, in microseconds.
    pub delay_us: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            max_attempts: 10_000,
            delay_us: 100,
        }
    }
}

/// Everything needed to bring up a [`BufferPlayout`](crate::BufferPlayout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutConfig {
    /// Number of buffers that may be loaded at once. 0 disables the feature.
    pub max_buffers: u32,
    /// Number of channels whose ports can play buffers.
    pub max_channels: u16,
    pub image: ImageVariant,
    /// Whether the loaded chip image implements buffer playout at all.
    pub image_supports_playout: bool,
    pub memory: ArenaRegion,
    pub memory_map: PlayoutMemoryMap,
    pub poll: PollConfig,
}

impl PlayoutConfig {
    /// Check internal consistency. Called by `BufferPlayout::new`.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_buffers > 0 {
            if self.memory.size == 0 {
                return Err("playout memory size is zero");
            }
            if self.memory.base % ARENA_GRANULARITY != 0 || self.memory.size % ARENA_GRANULARITY != 0 {
                return Err("playout memory is not aligned to the arena granularity");
            }
            let end = self.memory.base.checked_add(self.memory.size);
            if end.map_or(true, |end| end - 1 > ADDRESS_MASK) {
                return Err("playout memory exceeds the event address range");
            }
        }
        if self.poll.max_attempts == 0 {
            return Err("poll bound must allow at least one attempt");
        }
        if !self.memory_map.is_valid() {
            return Err("memory map holds an invalid field descriptor");
        }
        Ok(())
    }
}
