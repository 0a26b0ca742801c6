//! # vqe-playout
//!
//! A `no_std` driver for the buffer-playout block of a voice-processing
//! (echo cancellation) DSP chip attached over a register-mapped
//! external-memory bus. Short companded PCM buffers are uploaded into the
//! chip's external memory, then queued, started and stopped per channel and
//! per port through a small hardware event ring.
//!
//! ## Architecture
//!
//! | Layer | Module | Purpose |
//! |-------|--------|---------|
//! | Collaborators | [`bus`] | `DeviceBus` trait, field read-modify-write, bounded polling |
//! | Layout | [`memory_map`] / [`config`] | Hardware field locations and subsystem configuration |
//! | Memory | [`slot`] / [`arena`] | Buffer index pool and external-memory allocator |
//! | Buffers | [`buffer`] | Load, block load, unload, dependency counting |
//! | Events | [`event`] | Event record encoding and repeat/duration planning |
//! | Playout | [`channel`] / [`playout`] | Per-port state and the add/start/stop protocol |
//!
//! ## Quick start
//!
//! ```ignore
//! use vqe_playout::*;
//!
//! let mut playout = BufferPlayout::new(config, bus, delay)?;
//! let buffer = playout.load(&tone, tone.len() as u32, PcmLaw::ULaw)?;
//! let ch = playout.open_channel(0, ChannelSettings::default())?;
//!
//! playout.add(AddRequest {
//!     repeat: Repeat::Forever,
//!     ..AddRequest::new(ch, PlayoutPort::Rout, buffer.index)
//! })?;
//! playout.start(StartRequest::new(ch, PlayoutPort::Rout))?;
//! // ...
//! playout.stop(StopRequest { channel: ch, port: PlayoutPort::Rout, stop_cleanly: true })?;
//! playout.unload(buffer.index)?;
//! ```
//!
//! ## Concurrency
//!
//! The driver does no locking of its own. Every mutating call takes
//! `&mut self`; processes sharing one chip serialize access by holding their
//! chip-wide lock around the [`BufferPlayout`] value.

#![no_std]

extern crate alloc;

pub mod constants;
pub mod error;
pub mod bus;
pub mod memory_map;
pub mod config;
pub mod slot;
pub mod arena;
pub mod buffer;
pub mod event;
pub mod channel;
pub mod playout;

#[cfg(test)]
mod test_support;

pub use arena::MemoryArena;
pub use buffer::{BufferDescriptor, BufferRegistry, BufferStats, LoadedBuffer, PcmLaw};
pub use bus::{Device, DeviceBus};
pub use channel::{ChannelHandle, ChannelSettings, EchoOperationMode, PortStatus};
pub use config::{ArenaRegion, ImageVariant, PlayoutConfig, PollConfig};
pub use error::{FatalError, PlayoutError};
pub use event::{MixingMode, Repeat};
pub use memory_map::{FieldDescriptor, PlayoutMemoryMap, PortFields};
pub use playout::{
    AddRequest, BufferPlayout, PlayoutPort, PlayoutStats, StartRequest, StopOutcome, StopRequest,
};
pub use slot::SlotAllocator;
