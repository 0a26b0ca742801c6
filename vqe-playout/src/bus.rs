//! Access to the chip's register-mapped external memory.
//!
//! [`DeviceBus`] is the collaborator interface the host platform implements:
//! 16-bit word and burst accesses at byte addresses. [`Device`] wraps a bus
//! and a delay provider with the helpers the playout code needs: 32-bit
//! accesses, bit-field read-modify-write and bounded polling.

use embedded_hal::delay::DelayNs;

use crate::config::PollConfig;
use crate::error::{FatalError, PlayoutError, Result};
use crate::memory_map::FieldDescriptor;

/// Longest burst issued in one call, in 16-bit words.
const BURST_WORDS: usize = 128;

/// Word-level access to the chip's external memory.
///
/// Addresses are byte addresses; every access is 16-bit aligned.
pub trait DeviceBus {
    /// Error reported by the underlying transport.
    type Error: core::fmt::Debug;

    fn read_word(&mut self, address: u32) -> core::result::Result<u16, Self::Error>;

    fn write_word(&mut self, address: u32, value: u16) -> core::result::Result<(), Self::Error>;

    /// Read `words.len()` consecutive words starting at `address`.
    fn read_burst(&mut self, address: u32, words: &mut [u16]) -> core::result::Result<(), Self::Error>;

    /// Write `words` to consecutive words starting at `address`.
    fn write_burst(&mut self, address: u32, words: &[u16]) -> core::result::Result<(), Self::Error>;

    /// Read a 32-bit value stored as two words, most significant first.
    fn read_dword(&mut self, address: u32) -> core::result::Result<u32, Self::Error> {
        let high = self.read_word(address)?;
        let low = self.read_word(address + 2)?;
        Ok(((high as u32) << 16) | low as u32)
    }

    /// Write a 32-bit value as two words, most significant first.
    fn write_dword(&mut self, address: u32, value: u32) -> core::result::Result<(), Self::Error> {
        self.write_word(address, (value >> 16) as u16)?;
        self.write_word(address + 2, value as u16)
    }
}

/// Bus and delay provider bundled with playout-level helpers.
pub struct Device<B, D> {
    bus: B,
    delay: D,
}

impl<B, D> Device<B, D>
where
    B: DeviceBus,
    D: DelayNs,
{
    pub fn new(bus: B, delay: D) -> Self {
        Device { bus, delay }
    }

    /// Consume the device and return the bus and delay.
    pub fn release(self) -> (B, D) {
        (self.bus, self.delay)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    // ── Word access ────────────────────────────────────────────────────

    pub fn read_dword(&mut self, address: u32) -> Result<u32, B::Error> {
        self.bus.read_dword(address).map_err(PlayoutError::Bus)
    }

    pub fn write_dword(&mut self, address: u32, value: u32) -> Result<(), B::Error> {
        self.bus.write_dword(address, value).map_err(PlayoutError::Bus)
    }

    /// Read-modify-write: `new = (current & !mask) | value`.
    pub fn modify_dword(&mut self, address: u32, value: u32, mask: u32) -> Result<u32, B::Error> {
        let current = self.read_dword(address)?;
        let new_val = (current & !mask) | (value & mask);
        self.write_dword(address, new_val)?;
        Ok(new_val)
    }

    /// Write a run of 16-bit words, split into bursts of at most
    /// [`BURST_WORDS`].
    pub fn write_words(&mut self, address: u32, words: &[u16]) -> Result<(), B::Error> {
        let mut address = address;
        for chunk in words.chunks(BURST_WORDS) {
            self.bus.write_burst(address, chunk).map_err(PlayoutError::Bus)?;
            address += 2 * chunk.len() as u32;
        }
        Ok(())
    }

    /// Write bytes as big-endian 16-bit words. `bytes.len()` must be even.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), B::Error> {
        let mut words = [0u16; BURST_WORDS];
        let mut address = address;
        for chunk in bytes.chunks(2 * BURST_WORDS) {
            let n = chunk.len() / 2;
            for (word, pair) in words.iter_mut().zip(chunk.chunks_exact(2)) {
                *word = u16::from_be_bytes([pair[0], pair[1]]);
            }
            self.bus.write_burst(address, &words[..n]).map_err(PlayoutError::Bus)?;
            address += 2 * n as u32;
        }
        Ok(())
    }

    // ── Field access ───────────────────────────────────────────────────

    /// Read `field` from the word at `base + field.byte_offset`.
    pub fn read_field(&mut self, base: u32, field: &FieldDescriptor) -> Result<u32, B::Error> {
        let word = self.read_dword(base + field.byte_offset)?;
        Ok(field.extract(word))
    }

    /// Update `field` in the word at `base + field.byte_offset`, leaving the
    /// word's other bits untouched.
    pub fn write_field(&mut self, base: u32, field: &FieldDescriptor, value: u32) -> Result<(), B::Error> {
        self.modify_dword(
            base + field.byte_offset,
            value << field.bit_offset,
            field.mask(),
        )?;
        Ok(())
    }

    // ── Polling ────────────────────────────────────────────────────────

    /// Evaluate `done` until it returns `true`, sleeping `poll.delay_us`
    /// between attempts.
    ///
    /// Gives up with [`FatalError::DrainTimeout`] after `poll.max_attempts`
    /// evaluations.
    pub fn poll_until<F>(&mut self, poll: PollConfig, mut done: F) -> Result<(), B::Error>
    where
        F: FnMut(&mut Self) -> Result<bool, B::Error>,
    {
        for attempt in 0..poll.max_attempts {
            if done(self)? {
                log::trace!("poll satisfied after {} attempts", attempt + 1);
                return Ok(());
            }
            self.delay.delay_us(poll.delay_us);
        }
        log::error!("hardware did not drain after {} polls", poll.max_attempts);
        Err(FatalError::DrainTimeout {
            attempts: poll.max_attempts,
        }
        .into())
    }
}
