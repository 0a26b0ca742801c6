//! Hardware field locations used by the playout subsystem.
//!
//! The chip publishes its memory map as TLV records; parsing them is the job
//! of another component. This module only carries the result: for every
//! field, the byte offset of the 32-bit word holding it, the bit offset
//! inside that word, and its width. The values are data, never hard-coded.

use crate::constants::EVENT_SIZE;
use crate::playout::PlayoutPort;

/// Location of a bit field inside a 32-bit word of channel memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Byte offset of the containing 32-bit word, relative to the channel base.
    pub byte_offset: u32,
    /// Position of the field's least significant bit (0–31).
    pub bit_offset: u8,
    /// Width in bits (1–32).
    pub field_size: u8,
}

impl FieldDescriptor {
    pub const fn new(byte_offset: u32, bit_offset: u8, field_size: u8) -> Self {
        FieldDescriptor {
            byte_offset,
            bit_offset,
            field_size,
        }
    }

    /// Mask of the field's bits inside the containing word.
    pub const fn mask(&self) -> u32 {
        let width = if self.field_size >= 32 {
            u32::MAX
        } else {
            (1u32 << self.field_size) - 1
        };
        width << self.bit_offset
    }

    /// Extract the field from a word read from hardware.
    pub const fn extract(&self, word: u32) -> u32 {
        (word & self.mask()) >> self.bit_offset
    }

    /// Replace the field's bits of `word` with `value`.
    pub const fn insert(&self, word: u32, value: u32) -> u32 {
        (word & !self.mask()) | ((value << self.bit_offset) & self.mask())
    }

    /// A field fits in one word when `bit_offset + field_size <= 32`.
    pub const fn is_valid(&self) -> bool {
        self.field_size > 0 && self.bit_offset as u32 + self.field_size as u32 <= 32
    }
}

/// Per-port playout control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFields {
    /// Host-written write pointer into the event ring.
    pub write_ptr: FieldDescriptor,
    /// Host-written skip pointer (legacy images).
    pub skip_ptr: FieldDescriptor,
    /// Hardware-advanced read pointer.
    pub read_ptr: FieldDescriptor,
    /// Abandon the current event instead of letting it finish (legacy images).
    pub ignore_skip_clean: FieldDescriptor,
    /// Skip everything up to the skip pointer immediately (legacy images).
    pub hard_skip: FieldDescriptor,
}

impl PortFields {
    fn is_valid(&self) -> bool {
        [
            self.write_ptr,
            self.skip_ptr,
            self.read_ptr,
            self.ignore_skip_clean,
            self.hard_skip,
        ]
        .iter()
        .all(FieldDescriptor::is_valid)
    }
}

/// Memory map of the playout feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutMemoryMap {
    /// Address of channel 0's configuration memory.
    pub channel_base: u32,
    /// Distance between consecutive channels' configuration memory.
    pub channel_stride: u32,
    /// Control fields of the receive port.
    pub rout: PortFields,
    /// Control fields of the send port.
    pub sout: PortFields,
    /// Address of the first event ring.
    pub event_ring_base: u32,
}

impl PlayoutMemoryMap {
    /// Control fields of `port`.
    pub fn port(&self, port: PlayoutPort) -> &PortFields {
        match port {
            PlayoutPort::Rout => &self.rout,
            PlayoutPort::Sout => &self.sout,
        }
    }

    /// Address of channel `channel`'s configuration memory.
    pub fn channel_address(&self, channel: u16) -> u32 {
        self.channel_base + channel as u32 * self.channel_stride
    }

    /// Address of the word holding `field` for `channel`.
    pub fn field_address(&self, channel: u16, field: &FieldDescriptor) -> u32 {
        self.channel_address(channel) + field.byte_offset
    }

    /// Address of the event ring of (`channel`, `port`).
    ///
    /// Rings are laid out back to back, two per channel (Rout first).
    pub fn ring_address(&self, channel: u16, port: PlayoutPort, ring_slots: u32) -> u32 {
        let ring = channel as u32 * 2 + port.index() as u32;
        self.event_ring_base + ring * ring_slots * EVENT_SIZE
    }

    /// Address of event `slot` in the ring of (`channel`, `port`).
    pub fn event_address(&self, channel: u16, port: PlayoutPort, ring_slots: u32, slot: u32) -> u32 {
        self.ring_address(channel, port, ring_slots) + (slot % ring_slots) * EVENT_SIZE
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.channel_stride % 4 == 0 && self.rout.is_valid() && self.sout.is_valid()
    }
}
