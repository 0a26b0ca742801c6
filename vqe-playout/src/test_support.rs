//! Mock collaborators shared by the unit tests.

use alloc::collections::BTreeMap;

use embedded_hal::delay::DelayNs;

use crate::bus::DeviceBus;
use crate::config::{ArenaRegion, ImageVariant, PlayoutConfig, PollConfig};
use crate::memory_map::{FieldDescriptor, PlayoutMemoryMap, PortFields};
use crate::playout::PlayoutPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Word-addressable device memory. Unwritten words read as zero.
#[derive(Default)]
pub struct MockBus {
    words: BTreeMap<u32, u16>,
    /// Number of `write_burst` calls.
    pub bursts: usize,
    /// Number of word writes, burst words included.
    pub writes: usize,
    /// Reject every access once set.
    pub fail: bool,
    /// When the word at `.0` has been read `.1` more times, store the dword `.2`.
    armed: Option<(u32, u32, u32)>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(&self, address: u32) -> u16 {
        self.words.get(&address).copied().unwrap_or(0)
    }

    pub fn dword(&self, address: u32) -> u32 {
        ((self.word(address) as u32) << 16) | self.word(address + 2) as u32
    }

    pub fn set_dword(&mut self, address: u32, value: u32) {
        self.words.insert(address, (value >> 16) as u16);
        self.words.insert(address + 2, value as u16);
    }

    /// Store `value` at `address` after the word at `address` is read
    /// `reads` more times, simulating hardware progress during a poll.
    pub fn arm_dword_after_reads(&mut self, address: u32, reads: u32, value: u32) {
        self.armed = Some((address, reads, value));
    }

    pub fn set_field(&mut self, base: u32, field: &FieldDescriptor, value: u32) {
        let address = base + field.byte_offset;
        let word = self.dword(address);
        self.set_dword(address, field.insert(word, value));
    }

    pub fn field(&self, base: u32, field: &FieldDescriptor) -> u32 {
        field.extract(self.dword(base + field.byte_offset))
    }
}

impl DeviceBus for MockBus {
    type Error = MockError;

    fn read_word(&mut self, address: u32) -> Result<u16, MockError> {
        if self.fail {
            return Err(MockError);
        }
        if let Some((armed_at, reads, value)) = self.armed {
            if armed_at == address {
                if reads <= 1 {
                    self.armed = None;
                    self.set_dword(address, value);
                } else {
                    self.armed = Some((armed_at, reads - 1, value));
                }
            }
        }
        Ok(self.word(address))
    }

    fn write_word(&mut self, address: u32, value: u16) -> Result<(), MockError> {
        if self.fail {
            return Err(MockError);
        }
        self.writes += 1;
        self.words.insert(address, value);
        Ok(())
    }

    fn read_burst(&mut self, address: u32, words: &mut [u16]) -> Result<(), MockError> {
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.read_word(address + 2 * i as u32)?;
        }
        Ok(())
    }

    fn write_burst(&mut self, address: u32, words: &[u16]) -> Result<(), MockError> {
        self.bursts += 1;
        for (i, &w) in words.iter().enumerate() {
            self.write_word(address + 2 * i as u32, w)?;
        }
        Ok(())
    }
}

/// Delay provider that only accumulates the requested time.
#[derive(Default)]
pub struct MockDelay {
    pub total_ns: u64,
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += ns as u64;
    }
}

fn port_fields(offset: u32) -> PortFields {
    PortFields {
        write_ptr: FieldDescriptor::new(offset, 0, 7),
        skip_ptr: FieldDescriptor::new(offset, 8, 7),
        ignore_skip_clean: FieldDescriptor::new(offset, 16, 1),
        hard_skip: FieldDescriptor::new(offset, 17, 1),
        read_ptr: FieldDescriptor::new(offset + 4, 0, 7),
    }
}

pub const CHANNEL_BASE: u32 = 0x0008_0000;
pub const RING_BASE: u32 = 0x0020_0000;
pub const MEMORY_BASE: u32 = 0x0100_0000;
pub const MEMORY_SIZE: u32 = 0x0001_0000;

pub fn memory_map() -> PlayoutMemoryMap {
    PlayoutMemoryMap {
        channel_base: CHANNEL_BASE,
        channel_stride: 0x100,
        rout: port_fields(0x10),
        sout: port_fields(0x18),
        event_ring_base: RING_BASE,
    }
}

pub fn config(image: ImageVariant) -> PlayoutConfig {
    PlayoutConfig {
        max_buffers: 8,
        max_channels: 4,
        image,
        image_supports_playout: true,
        memory: ArenaRegion {
            base: MEMORY_BASE,
            size: MEMORY_SIZE,
        },
        memory_map: memory_map(),
        poll: PollConfig {
            max_attempts: 16,
            delay_us: 5,
        },
    }
}

/// Move the hardware read pointer of (`channel`, `port`).
pub fn set_read_ptr(bus: &mut MockBus, channel: u16, port: PlayoutPort, value: u32) {
    let map = memory_map();
    bus.set_field(map.channel_address(channel), &map.port(port).read_ptr, value);
}

/// Current value of a port field as seen by the hardware.
pub fn port_field(
    bus: &MockBus,
    channel: u16,
    port: PlayoutPort,
    select: fn(&PortFields) -> FieldDescriptor,
) -> u32 {
    let map = memory_map();
    bus.field(map.channel_address(channel), &select(map.port(port)))
}
