//! Per-channel playout bookkeeping.
//!
//! The host keeps a shadow of every port's ring pointers plus the flags that
//! gate the add/start/stop protocol. Channels are addressed by a
//! [`ChannelHandle`] that embeds a generation counter, so a handle kept past
//! `close_channel` is rejected instead of silently reaching the next user of
//! the same index.

use alloc::vec::Vec;

use crate::error::{PlayoutError, Result};
use crate::playout::PlayoutPort;

const INDEX_MASK: u32 = 0xFFFF;
const GENERATION_SHIFT: u32 = 16;
const GENERATION_MASK: u32 = 0xFF;

/// Handle of an open channel: index in bits 0–15, generation in bits 16–23.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u32);

impl ChannelHandle {
    pub const fn new(index: u16, generation: u8) -> Self {
        ChannelHandle(index as u32 | (generation as u32) << GENERATION_SHIFT)
    }

    /// Rebuild a handle from its packed form.
    pub const fn from_raw(raw: u32) -> Self {
        ChannelHandle(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    pub const fn generation(self) -> u8 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u8
    }
}

/// Echo canceller operating mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoOperationMode {
    #[default]
    Normal,
    /// Echo path model is frozen; playout is refused.
    HtFreeze,
    HtReset,
    /// Channel processing is off; playout is refused.
    PowerDown,
    NoEcho,
    SpeechRecognition,
}

/// Channel configuration relevant to playout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub mode: EchoOperationMode,
    /// Playout is mixed in by the NLP block, so starting requires it.
    pub nlp_enabled: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            mode: EchoOperationMode::Normal,
            nlp_enabled: true,
        }
    }
}

impl ChannelSettings {
    /// Whether `start` may run on a channel with these settings.
    pub fn check_playable<E>(&self) -> Result<(), E> {
        match self.mode {
            EchoOperationMode::PowerDown => Err(PlayoutError::ChannelPoweredDown),
            EchoOperationMode::HtFreeze => Err(PlayoutError::ChannelFrozen),
            _ if !self.nlp_enabled => Err(PlayoutError::NlpDisabled),
            _ => Ok(()),
        }
    }
}

/// A buffer held by the events of one add request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedBuffer {
    pub buffer_index: u32,
    /// Ring slot just past the request's last event.
    pub end: u32,
}

/// Host-side state of one port's event ring.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortState {
    /// Next ring slot to write.
    pub write_ptr: u32,
    /// Last skip pointer written to hardware (legacy images).
    pub skip_ptr: u32,
    pub playing: bool,
    pub notify_on_stop: bool,
    pub user_event_id: u32,
    /// The last stop abandoned playback; wait for the hardware to drain
    /// before reusing the ring.
    pub hard_stop: bool,
    /// Hardware write pointer captured by the last stop.
    pub hard_stop_write_ptr: u32,
    /// Events were added since the last start.
    pub buf_added: bool,
    /// An indefinitely repeating buffer is queued.
    pub repeat_used: bool,
    /// Buffers referenced by queued events, one entry per add, oldest first.
    pub referenced: Vec<QueuedBuffer>,
    /// Leading entries of `referenced` already handed to the hardware.
    pub published: usize,
}

impl PortState {
    fn with_capacity(events: u32) -> Self {
        PortState {
            referenced: Vec::with_capacity(events as usize),
            ..PortState::default()
        }
    }

    /// Return to idle, keeping the ring position and reference storage.
    fn reset(&mut self) {
        self.skip_ptr = 0;
        self.playing = false;
        self.notify_on_stop = false;
        self.user_event_id = 0;
        self.hard_stop = false;
        self.hard_stop_write_ptr = 0;
        self.buf_added = false;
        self.repeat_used = false;
        self.referenced.clear();
        self.published = 0;
    }

    /// Drop the published entries whose events the hardware has consumed,
    /// given its read pointer and the published write pointer. Returns the
    /// buffers to release.
    pub fn take_consumed(
        &mut self,
        read: u32,
        write: u32,
        slots: u32,
    ) -> impl Iterator<Item = u32> + '_ {
        let pending = (write + slots - read) % slots;
        let consumed = self.referenced[..self.published]
            .iter()
            .take_while(|q| {
                let ahead = (q.end + slots - read) % slots;
                ahead == 0 || ahead > pending
            })
            .count();
        self.published -= consumed;
        self.referenced.drain(..consumed).map(|q| q.buffer_index)
    }
}

/// Snapshot of a port returned by `port_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub playing: bool,
    pub buf_added: bool,
    pub hard_stop: bool,
    pub repeat_used: bool,
    pub notify_on_stop: bool,
    pub user_event_id: u32,
    pub write_ptr: u32,
    /// Number of add requests whose buffers are still referenced.
    pub queued_adds: usize,
}

impl From<&PortState> for PortStatus {
    fn from(port: &PortState) -> Self {
        PortStatus {
            playing: port.playing,
            buf_added: port.buf_added,
            hard_stop: port.hard_stop,
            repeat_used: port.repeat_used,
            notify_on_stop: port.notify_on_stop,
            user_event_id: port.user_event_id,
            write_ptr: port.write_ptr,
            queued_adds: port.referenced.len(),
        }
    }
}

/// One row of the channel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEntry {
    pub open: bool,
    pub generation: u8,
    pub settings: ChannelSettings,
    ports: [PortState; 2],
}

impl ChannelEntry {
    pub fn port(&self, port: PlayoutPort) -> &PortState {
        &self.ports[port.index()]
    }

    pub fn port_mut(&mut self, port: PlayoutPort) -> &mut PortState {
        &mut self.ports[port.index()]
    }
}

/// Fixed table of channels.
pub struct ChannelTable {
    entries: Vec<ChannelEntry>,
}

impl ChannelTable {
    /// `events` is the per-port ring capacity, used to size reference lists.
    pub fn new(channels: u16, events: u32) -> Self {
        let entries = (0..channels)
            .map(|_| ChannelEntry {
                open: false,
                generation: 0,
                settings: ChannelSettings::default(),
                ports: [PortState::with_capacity(events), PortState::with_capacity(events)],
            })
            .collect();
        ChannelTable { entries }
    }

    /// Mark `index` open and hand out its handle.
    pub fn open<E>(&mut self, index: u16, settings: ChannelSettings) -> Result<ChannelHandle, E> {
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(PlayoutError::<E>::ChannelIndexOutOfRange(index as u32))?;
        if entry.open {
            return Err(PlayoutError::ChannelAlreadyOpen(index as u32));
        }
        entry.open = true;
        entry.settings = settings;
        Ok(ChannelHandle::new(index, entry.generation))
    }

    /// Close `index`: reset its ports and invalidate outstanding handles.
    pub fn retire(&mut self, index: u16) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            entry.open = false;
            entry.generation = entry.generation.wrapping_add(1);
            entry.ports.iter_mut().for_each(PortState::reset);
        }
    }

    /// Validate `handle` and return the channel index it names.
    pub fn resolve<E>(&self, handle: ChannelHandle) -> Result<u16, E> {
        let index = handle.index();
        let entry = self
            .entries
            .get(index as usize)
            .ok_or(PlayoutError::<E>::ChannelIndexOutOfRange(index))?;
        if !entry.open {
            return Err(PlayoutError::ChannelNotOpen(index));
        }
        if entry.generation != handle.generation() {
            return Err(PlayoutError::StaleChannelHandle(handle.raw()));
        }
        Ok(index as u16)
    }

    /// Entry of a resolved channel index.
    pub fn entry(&self, index: u16) -> &ChannelEntry {
        &self.entries[index as usize]
    }

    pub fn entry_mut(&mut self, index: u16) -> &mut ChannelEntry {
        &mut self.entries[index as usize]
    }

    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|e| e.open).count()
    }

    /// Number of ports currently marked playing.
    pub fn playing_count(&self) -> usize {
        self.entries
            .iter()
            .flat_map(|e| e.ports.iter())
            .filter(|p| p.playing)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockError;

    #[test]
    fn handle_packs_index_and_generation() {
        let h = ChannelHandle::new(0x1234, 0xAB);
        assert_eq!(h.raw(), 0x00AB_1234);
        assert_eq!(h.index(), 0x1234);
        assert_eq!(h.generation(), 0xAB);
        assert_eq!(ChannelHandle::from_raw(h.raw()), h);
    }

    #[test]
    fn open_and_resolve() {
        let mut table = ChannelTable::new(2, 31);
        let h = table.open::<MockError>(1, ChannelSettings::default()).unwrap();
        assert_eq!(table.resolve::<MockError>(h).unwrap(), 1);
        assert_eq!(table.open_count(), 1);
        assert!(matches!(
            table.open::<MockError>(1, ChannelSettings::default()),
            Err(PlayoutError::ChannelAlreadyOpen(1))
        ));
        assert!(matches!(
            table.open::<MockError>(2, ChannelSettings::default()),
            Err(PlayoutError::ChannelIndexOutOfRange(2))
        ));
    }

    #[test]
    fn retired_handle_is_rejected() {
        let mut table = ChannelTable::new(1, 31);
        let old = table.open::<MockError>(0, ChannelSettings::default()).unwrap();
        table.retire(0);
        assert!(matches!(
            table.resolve::<MockError>(old),
            Err(PlayoutError::ChannelNotOpen(0))
        ));
        let new = table.open::<MockError>(0, ChannelSettings::default()).unwrap();
        assert_ne!(old, new);
        assert!(matches!(
            table.resolve::<MockError>(old),
            Err(PlayoutError::StaleChannelHandle(_))
        ));
        assert!(table.resolve::<MockError>(new).is_ok());
    }

    #[test]
    fn retire_resets_ports_but_keeps_ring_position() {
        let mut table = ChannelTable::new(1, 31);
        table.open::<MockError>(0, ChannelSettings::default()).unwrap();
        let port = table.entry_mut(0).port_mut(PlayoutPort::Sout);
        port.write_ptr = 7;
        port.playing = true;
        port.referenced.push(QueuedBuffer { buffer_index: 3, end: 7 });
        port.published = 1;
        table.retire(0);
        let port = table.entry(0).port(PlayoutPort::Sout);
        assert_eq!(port.write_ptr, 7);
        assert!(!port.playing);
        assert!(port.referenced.is_empty());
        assert_eq!(port.published, 0);
    }

    #[test]
    fn every_entry_reserves_reference_storage() {
        let table = ChannelTable::new(3, 127);
        for ch in 0..3 {
            for port in PlayoutPort::ALL {
                assert!(table.entry(ch).port(port).referenced.capacity() >= 127);
            }
        }
    }

    fn queued(ends: &[u32], published: usize) -> PortState {
        PortState {
            referenced: ends
                .iter()
                .enumerate()
                .map(|(i, &end)| QueuedBuffer { buffer_index: i as u32, end })
                .collect(),
            published,
            ..PortState::default()
        }
    }

    #[test]
    fn consumed_prefix_is_taken() {
        // Published adds end at 2, 3 and 5; the chip is playing slot 3.
        let mut port = queued(&[2, 3, 5, 6], 3);
        let taken: Vec<u32> = port.take_consumed(3, 5, 128).collect();
        assert_eq!(taken, [0, 1]);
        assert_eq!(port.published, 1);
        assert_eq!(port.referenced[0].end, 5);
        // The unpublished add survives a fully drained ring.
        let taken: Vec<u32> = port.take_consumed(5, 5, 128).collect();
        assert_eq!(taken, [2]);
        assert_eq!(port.referenced.len(), 1);
        assert_eq!(port.published, 0);
    }

    #[test]
    fn consumed_check_handles_wrap() {
        // Events occupy slots 30, 31 and 0 of a 32-slot ring.
        let mut port = queued(&[31, 0, 1], 3);
        assert_eq!(port.take_consumed(31, 1, 32).count(), 1);
        assert_eq!(port.take_consumed(0, 1, 32).count(), 1);
        assert_eq!(port.take_consumed(1, 1, 32).count(), 1);
        assert!(port.referenced.is_empty());
    }

    #[test]
    fn playable_settings() {
        let ok = ChannelSettings::default();
        assert!(ok.check_playable::<MockError>().is_ok());
        let down = ChannelSettings { mode: EchoOperationMode::PowerDown, ..ok };
        assert!(matches!(down.check_playable::<MockError>(), Err(PlayoutError::ChannelPoweredDown)));
        let frozen = ChannelSettings { mode: EchoOperationMode::HtFreeze, ..ok };
        assert!(matches!(frozen.check_playable::<MockError>(), Err(PlayoutError::ChannelFrozen)));
        let no_nlp = ChannelSettings { nlp_enabled: false, ..ok };
        assert!(matches!(no_nlp.check_playable::<MockError>(), Err(PlayoutError::NlpDisabled)));
    }
}
