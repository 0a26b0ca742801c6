//! Buffer playout on channel ports.
//!
//! [`BufferPlayout`] is the entry point of the crate. It owns the device
//! collaborators, the [`BufferRegistry`] and the channel table, and drives
//! each port's hardware event ring through its life cycle:
//!
//! ```text
//!   Idle --add--> Queued --start--> Playing --stop--> Idle
//!                   ^                  |
//!                   +------add---------+
//! ```
//!
//! The host owns the write pointer and (on legacy images) the skip pointer;
//! the chip advances the read pointer as it consumes events. The ring holds
//! one slot less than its size so that `write == read` always means empty.
//!
//! Every mutating call takes `&mut self`; callers sharing one chip wrap the
//! whole value in their own lock.

use embedded_hal::delay::DelayNs;

use crate::buffer::{BufferDescriptor, BufferRegistry, BufferStats, LoadedBuffer, PcmLaw};
use crate::bus::{Device, DeviceBus};
use crate::channel::{ChannelHandle, ChannelSettings, ChannelTable, PortStatus, QueuedBuffer};
use crate::config::{ImageVariant, PlayoutConfig};
use crate::constants::{
    BUFFER_SIZE_GRANULARITY, EVENT_SIZE, MAX_GAIN_DB, MIN_BUFFER_SIZE, MIN_GAIN_DB, SKIP_PTR_LAG,
    SKIP_PTR_MODULUS,
};
use crate::error::{PlayoutError, Result};
use crate::event::{
    encode_gain, word_offset, EventPlan, MixingMode, PlayoutEvent, Repeat, W1_REPEAT_FOREVER,
    W3_HARD_SKIP, W3_SKIP,
};
use crate::memory_map::{FieldDescriptor, PortFields};

// ── Request types ──────────────────────────────────────────────────────────

/// Playback direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutPort {
    /// Receive path, played towards the line.
    Rout = 0,
    /// Send path, played towards the network.
    Sout = 1,
}

impl PlayoutPort {
    pub const ALL: [PlayoutPort; 2] = [PlayoutPort::Rout, PlayoutPort::Sout];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for PlayoutPort {
    type Error = u32;

    fn try_from(value: u32) -> core::result::Result<Self, u32> {
        match value {
            0 => Ok(PlayoutPort::Rout),
            1 => Ok(PlayoutPort::Sout),
            other => Err(other),
        }
    }
}

/// Queue a loaded buffer on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRequest {
    pub channel: ChannelHandle,
    pub port: PlayoutPort,
    pub buffer_index: u32,
    pub mixing: MixingMode,
    /// Gain in dB, within [`MIN_GAIN_DB`]..=[`MAX_GAIN_DB`].
    pub gain_db: i32,
    pub repeat: Repeat,
    /// Bytes of the buffer to play per pass; the whole buffer when `None`.
    pub play_length: Option<u32>,
}

impl AddRequest {
    /// Play `buffer_index` once, mixed, at unity gain.
    pub fn new(channel: ChannelHandle, port: PlayoutPort, buffer_index: u32) -> Self {
        AddRequest {
            channel,
            port,
            buffer_index,
            mixing: MixingMode::Mix,
            gain_db: 0,
            repeat: Repeat::Once,
            play_length: None,
        }
    }
}

/// Publish the queued events of a port to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRequest {
    pub channel: ChannelHandle,
    pub port: PlayoutPort,
    /// Ask for a stop notification once playback ends.
    pub notify_on_stop: bool,
    /// Opaque value reported with the stop notification.
    pub user_event_id: u32,
    /// Start even if the previous playback has not finished.
    pub allow_if_active: bool,
}

impl StartRequest {
    pub fn new(channel: ChannelHandle, port: PlayoutPort) -> Self {
        StartRequest {
            channel,
            port,
            notify_on_stop: false,
            user_event_id: 0,
            allow_if_active: false,
        }
    }
}

/// Stop playback on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub channel: ChannelHandle,
    pub port: PlayoutPort,
    /// Let the event being played finish instead of cutting it.
    pub stop_cleanly: bool,
}

/// What `stop` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopOutcome {
    /// The port was not playing; nothing was touched.
    pub already_stopped: bool,
    /// A stop notification had been requested at start.
    pub notify_on_stop: bool,
    pub user_event_id: u32,
}

/// Subsystem-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutStats {
    pub buffers: BufferStats,
    pub channels_open: usize,
    pub ports_playing: usize,
}

// ── Façade ─────────────────────────────────────────────────────────────────

/// Buffer playout subsystem of one chip.
pub struct BufferPlayout<B, D> {
    config: PlayoutConfig,
    device: Device<B, D>,
    buffers: BufferRegistry,
    channels: ChannelTable,
}

impl<B, D> BufferPlayout<B, D>
where
    B: DeviceBus,
    D: DelayNs,
{
    pub fn new(config: PlayoutConfig, bus: B, delay: D) -> Result<Self, B::Error> {
        config.validate().map_err(PlayoutError::<B::Error>::InvalidConfig)?;
        log::info!(
            "buffer playout: {} buffers, {} channels, {:?} image, {} bytes at {:#x}",
            config.max_buffers,
            config.max_channels,
            config.image,
            config.memory.size,
            config.memory.base
        );
        Ok(BufferPlayout {
            buffers: BufferRegistry::new(config.max_buffers, config.memory),
            channels: ChannelTable::new(config.max_channels, config.image.event_capacity()),
            device: Device::new(bus, delay),
            config,
        })
    }

    /// Tear down and hand back the collaborators.
    pub fn release(self) -> (B, D) {
        self.device.release()
    }

    pub fn bus(&self) -> &B {
        self.device.bus()
    }

    pub fn bus_mut(&mut self) -> &mut B {
        self.device.bus_mut()
    }

    pub fn config(&self) -> &PlayoutConfig {
        &self.config
    }

    pub fn stats(&self) -> PlayoutStats {
        PlayoutStats {
            buffers: self.buffers.stats(),
            channels_open: self.channels.open_count(),
            ports_playing: self.channels.playing_count(),
        }
    }

    // ── Buffers ────────────────────────────────────────────────────────

    /// Load `size` bytes of `pattern` into playout memory.
    pub fn load(&mut self, pattern: &[u8], size: u32, law: PcmLaw) -> Result<LoadedBuffer, B::Error> {
        self.ensure_enabled()?;
        self.buffers.load(&mut self.device, pattern, size, law)
    }

    /// Reserve a buffer whose contents arrive later through
    /// [`load_block`](Self::load_block).
    pub fn load_block_init(&mut self, size: u32, law: PcmLaw) -> Result<LoadedBuffer, B::Error> {
        self.ensure_enabled()?;
        self.buffers.load_block_init(size, law)
    }

    pub fn load_block(&mut self, index: u32, offset: u32, data: &[u8]) -> Result<(), B::Error> {
        self.ensure_enabled()?;
        self.buffers.load_block(&mut self.device, index, offset, data)
    }

    /// Unload a buffer. References held by events the hardware has already
    /// played are dropped first.
    pub fn unload(&mut self, index: u32) -> Result<(), B::Error> {
        self.ensure_enabled()?;
        if self.buffers.descriptor::<B::Error>(index)?.dependency_count > 0 {
            for ch in 0..self.config.max_channels {
                if !self.channels.entry(ch).open {
                    continue;
                }
                for port in PlayoutPort::ALL {
                    self.release_consumed(ch, port)?;
                }
            }
        }
        self.buffers.unload(index)
    }

    pub fn buffer(&self, index: u32) -> Result<BufferDescriptor, B::Error> {
        self.buffers.descriptor(index).copied()
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Open channel `index` for playout.
    ///
    /// Both rings start empty at the position the hardware reports.
    pub fn open_channel(&mut self, index: u16, settings: ChannelSettings) -> Result<ChannelHandle, B::Error> {
        let handle = self.channels.open::<B::Error>(index, settings)?;
        for port in PlayoutPort::ALL {
            if let Err(err) = self.sync_port(index, port) {
                self.channels.retire(index);
                return Err(err);
            }
        }
        log::debug!("opened channel {} as {:#x}", index, handle.raw());
        Ok(handle)
    }

    pub fn update_channel(&mut self, handle: ChannelHandle, settings: ChannelSettings) -> Result<(), B::Error> {
        let ch = self.channels.resolve::<B::Error>(handle)?;
        self.channels.entry_mut(ch).settings = settings;
        Ok(())
    }

    /// Hard-stop both ports, drop their buffer references and invalidate
    /// `handle`.
    pub fn close_channel(&mut self, handle: ChannelHandle) -> Result<(), B::Error> {
        let ch = self.channels.resolve::<B::Error>(handle)?;
        for port in PlayoutPort::ALL {
            if self.channels.entry(ch).port(port).playing {
                self.stop_port(ch, port, false)?;
            }
            self.release_references(ch, port);
        }
        self.channels.retire(ch);
        log::debug!("closed channel {}", ch);
        Ok(())
    }

    pub fn port_status(&self, handle: ChannelHandle, port: PlayoutPort) -> Result<PortStatus, B::Error> {
        let ch = self.channels.resolve::<B::Error>(handle)?;
        Ok(self.channels.entry(ch).port(port).into())
    }

    // ── Event ring ─────────────────────────────────────────────────────

    /// Queue a buffer on a port. The hardware sees it after the next
    /// [`start`](Self::start).
    pub fn add(&mut self, req: AddRequest) -> Result<(), B::Error> {
        self.ensure_enabled()?;
        let ch = self.channels.resolve::<B::Error>(req.channel)?;
        if !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&req.gain_db) {
            return Err(PlayoutError::GainOutOfRange(req.gain_db));
        }
        let desc = *self.buffers.descriptor::<B::Error>(req.buffer_index)?;
        let play_length = req.play_length.unwrap_or(desc.size);
        if play_length < MIN_BUFFER_SIZE
            || play_length % BUFFER_SIZE_GRANULARITY != 0
            || play_length > desc.size
        {
            return Err(PlayoutError::InvalidPlayLength(play_length));
        }
        let state = self.channels.entry(ch).port(req.port);
        if req.repeat == Repeat::Forever && state.repeat_used {
            return Err(PlayoutError::RepeatAlreadyUsed);
        }
        let (write, hard_stop, drain_target) = (state.write_ptr, state.hard_stop, state.hard_stop_write_ptr);
        let plan = EventPlan::new::<B::Error>(req.repeat, play_length)?;
        let count = plan.len();

        if !self.has_room(ch, req.port, write, count)? {
            if hard_stop {
                log::debug!("ring full after hard stop, waiting for drain");
                self.wait_for_read_ptr(ch, req.port, drain_target)?;
            }
            if !hard_stop || !self.has_room(ch, req.port, write, count)? {
                log::warn!(
                    "event ring of channel {} {:?} has no room for {} events",
                    ch,
                    req.port,
                    count
                );
                return Err(PlayoutError::EventBufferFull);
            }
        }

        let slots = self.slots();
        let gain = encode_gain(req.gain_db);
        for (k, segment) in plan.segments().enumerate() {
            let slot = (write + k as u32) % slots;
            let event = PlayoutEvent::for_segment(segment, desc.base_address, desc.law, req.mixing, gain);
            self.write_event(ch, req.port, slot, &event)?;
        }

        self.buffers.add_dependency::<B::Error>(req.buffer_index)?;
        let state = self.channels.entry_mut(ch).port_mut(req.port);
        state.write_ptr = (write + count) % slots;
        state.referenced.push(QueuedBuffer {
            buffer_index: req.buffer_index,
            end: state.write_ptr,
        });
        state.buf_added = true;
        if plan.is_forever() {
            state.repeat_used = true;
        }
        log::debug!(
            "channel {} {:?}: queued buffer {} as {} events, write ptr {}",
            ch,
            req.port,
            req.buffer_index,
            count,
            state.write_ptr
        );
        Ok(())
    }

    /// Publish the queued events of a port to the hardware.
    pub fn start(&mut self, req: StartRequest) -> Result<(), B::Error> {
        self.ensure_enabled()?;
        let ch = self.channels.resolve::<B::Error>(req.channel)?;
        let entry = self.channels.entry(ch);
        entry.settings.check_playable::<B::Error>()?;
        let state = entry.port(req.port);
        if !state.buf_added {
            return Err(PlayoutError::NothingQueued);
        }
        let (write, playing, hard_stop, drain_target) =
            (state.write_ptr, state.playing, state.hard_stop, state.hard_stop_write_ptr);

        if playing && !req.allow_if_active && !self.is_drained(ch, req.port)? {
            log::warn!("channel {} {:?}: playout still active", ch, req.port);
            return Err(PlayoutError::StillActive);
        }
        if hard_stop {
            self.wait_for_read_ptr(ch, req.port, drain_target)?;
        }
        self.release_consumed(ch, req.port)?;

        let skip = match self.config.image {
            ImageVariant::Legacy => {
                let skip = (write + SKIP_PTR_MODULUS - SKIP_PTR_LAG) % SKIP_PTR_MODULUS;
                self.write_port_field(ch, req.port, |f| f.ignore_skip_clean, 0)?;
                self.write_port_field(ch, req.port, |f| f.hard_skip, 0)?;
                self.write_port_field(ch, req.port, |f| f.skip_ptr, skip)?;
                skip
            }
            ImageVariant::Extended => 0,
        };
        self.write_port_field(ch, req.port, |f| f.write_ptr, write)?;

        let state = self.channels.entry_mut(ch).port_mut(req.port);
        state.skip_ptr = skip;
        state.published = state.referenced.len();
        state.playing = true;
        state.buf_added = false;
        state.hard_stop = false;
        state.notify_on_stop = req.notify_on_stop;
        state.user_event_id = req.user_event_id;
        log::debug!("channel {} {:?}: started, write ptr {}", ch, req.port, write);
        Ok(())
    }

    /// Stop playback on a port.
    ///
    /// Stopping an idle port reports `already_stopped` and touches nothing.
    pub fn stop(&mut self, req: StopRequest) -> Result<StopOutcome, B::Error> {
        self.ensure_enabled()?;
        let ch = self.channels.resolve::<B::Error>(req.channel)?;
        if !self.channels.entry(ch).port(req.port).playing {
            return Ok(StopOutcome {
                already_stopped: true,
                ..StopOutcome::default()
            });
        }
        let outcome = self.stop_port(ch, req.port, req.stop_cleanly)?;
        self.release_references(ch, req.port);
        Ok(outcome)
    }

    // ── Private helpers ────────────────────────────────────────────────

    fn ensure_enabled(&self) -> Result<(), B::Error> {
        if self.config.max_buffers == 0 {
            return Err(PlayoutError::FeatureDisabled);
        }
        if !self.config.image_supports_playout {
            return Err(PlayoutError::ImageUnsupported);
        }
        Ok(())
    }

    fn slots(&self) -> u32 {
        self.config.image.ring_slots()
    }

    fn stop_port(&mut self, ch: u16, port: PlayoutPort, stop_cleanly: bool) -> Result<StopOutcome, B::Error> {
        let slots = self.slots();
        let read = self.read_ptr(ch, port)?;
        let published = self.read_port_field(ch, port, |f| f.write_ptr)?;

        if read != published {
            let last = (published + slots - 1) % slots;
            let address = self.event_address(ch, port, last) + word_offset(1);
            self.device.modify_dword(address, 0, W1_REPEAT_FOREVER)?;

            match self.config.image {
                ImageVariant::Extended => {
                    let bits = if stop_cleanly { W3_SKIP } else { W3_SKIP | W3_HARD_SKIP };
                    let mut slot = read;
                    while slot != published {
                        let address = self.event_address(ch, port, slot) + word_offset(3);
                        self.device.modify_dword(address, bits, bits)?;
                        log::trace!("channel {} {:?}: skip event {}", ch, port, slot);
                        slot = (slot + 1) % slots;
                    }
                }
                ImageVariant::Legacy => {
                    let hard = (!stop_cleanly) as u32;
                    self.write_port_field(ch, port, |f| f.ignore_skip_clean, hard)?;
                    self.write_port_field(ch, port, |f| f.hard_skip, hard)?;
                    self.write_port_field(ch, port, |f| f.skip_ptr, published)?;
                    self.channels.entry_mut(ch).port_mut(port).skip_ptr = published;
                }
            }
        }

        let state = self.channels.entry_mut(ch).port_mut(port);
        let outcome = StopOutcome {
            already_stopped: false,
            notify_on_stop: state.notify_on_stop,
            user_event_id: state.user_event_id,
        };
        // Events added after the last start were never published; drop them.
        state.write_ptr = published;
        state.hard_stop_write_ptr = published;
        state.hard_stop = !stop_cleanly;
        state.playing = false;
        state.notify_on_stop = false;
        state.repeat_used = false;
        state.buf_added = false;
        log::debug!(
            "channel {} {:?}: stopped ({}), read {} write {}",
            ch,
            port,
            if stop_cleanly { "clean" } else { "hard" },
            read,
            published
        );
        Ok(outcome)
    }

    /// Empty the ring by moving the write pointer onto the read pointer.
    fn sync_port(&mut self, ch: u16, port: PlayoutPort) -> Result<(), B::Error> {
        let read = self.read_ptr(ch, port)?;
        self.write_port_field(ch, port, |f| f.write_ptr, read)?;
        self.channels.entry_mut(ch).port_mut(port).write_ptr = read;
        Ok(())
    }

    fn release_references(&mut self, ch: u16, port: PlayoutPort) {
        let state = self.channels.entry_mut(ch).port_mut(port);
        state.published = 0;
        for queued in state.referenced.drain(..) {
            self.buffers.drop_dependency(queued.buffer_index);
        }
    }

    /// Release the references of published events the hardware has played.
    fn release_consumed(&mut self, ch: u16, port: PlayoutPort) -> Result<(), B::Error> {
        if self.channels.entry(ch).port(port).published == 0 {
            return Ok(());
        }
        let slots = self.slots();
        let read = self.read_ptr(ch, port)?;
        let write = self.read_port_field(ch, port, |f| f.write_ptr)? % slots;
        let state = self.channels.entry_mut(ch).port_mut(port);
        for index in state.take_consumed(read, write, slots) {
            self.buffers.drop_dependency(index);
        }
        Ok(())
    }

    /// Whether `count` more events fit behind `write`.
    fn has_room(&mut self, ch: u16, port: PlayoutPort, write: u32, count: u32) -> Result<bool, B::Error> {
        let slots = self.slots();
        let read = self.read_ptr(ch, port)?;
        let queued = (write + slots - read) % slots;
        Ok(count <= self.config.image.event_capacity() - queued)
    }

    /// The hardware consumed everything published to it.
    fn is_drained(&mut self, ch: u16, port: PlayoutPort) -> Result<bool, B::Error> {
        let read = self.read_ptr(ch, port)?;
        let published = self.read_port_field(ch, port, |f| f.write_ptr)?;
        Ok(read == published)
    }

    fn wait_for_read_ptr(&mut self, ch: u16, port: PlayoutPort, target: u32) -> Result<(), B::Error> {
        let poll = self.config.poll;
        let map = self.config.memory_map;
        let base = map.channel_address(ch);
        let field = map.port(port).read_ptr;
        let slots = self.slots();
        self.device
            .poll_until(poll, |dev| Ok(dev.read_field(base, &field)? % slots == target))
    }

    fn read_ptr(&mut self, ch: u16, port: PlayoutPort) -> Result<u32, B::Error> {
        let slots = self.slots();
        Ok(self.read_port_field(ch, port, |f| f.read_ptr)? % slots)
    }

    fn read_port_field<F>(&mut self, ch: u16, port: PlayoutPort, select: F) -> Result<u32, B::Error>
    where
        F: Fn(&PortFields) -> FieldDescriptor,
    {
        let map = &self.config.memory_map;
        let field = select(map.port(port));
        let base = map.channel_address(ch);
        self.device.read_field(base, &field)
    }

    fn write_port_field<F>(&mut self, ch: u16, port: PlayoutPort, select: F, value: u32) -> Result<(), B::Error>
    where
        F: Fn(&PortFields) -> FieldDescriptor,
    {
        let map = &self.config.memory_map;
        let field = select(map.port(port));
        let base = map.channel_address(ch);
        self.device.write_field(base, &field, value)
    }

    fn event_address(&self, ch: u16, port: PlayoutPort, slot: u32) -> u32 {
        self.config
            .memory_map
            .event_address(ch, port, self.slots(), slot)
    }

    fn write_event(&mut self, ch: u16, port: PlayoutPort, slot: u32, event: &PlayoutEvent) -> Result<(), B::Error> {
        let mut words = [0u16; (EVENT_SIZE / 2) as usize];
        for (pair, value) in words.chunks_exact_mut(2).zip(event.encode()) {
            pair[0] = (value >> 16) as u16;
            pair[1] = value as u16;
        }
        let address = self.event_address(ch, port, slot);
        log::trace!("channel {} {:?}: event {} at {:#x}", ch, port, slot, address);
        self.device.write_words(address, &words)
    }
}
