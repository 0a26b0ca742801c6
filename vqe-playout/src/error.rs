//! Error types for the playout subsystem.
//!
//! Every public operation returns [`PlayoutError`]. Validation, exhaustion
//! and state-conflict failures are recoverable by the caller; the
//! [`Fatal`](PlayoutError::Fatal) class reports a broken internal invariant or
//! an unresponsive device and is never produced by bad arguments alone.

use thiserror::Error;

/// Internal-consistency or hardware-responsiveness failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
    /// A slot was released that was not reserved.
    #[error("slot {0} released while not reserved")]
    SlotNotAllocated(u32),
    /// The arena needed a spare node to split a block and none was left.
    #[error("arena node pool exhausted")]
    NodePoolExhausted,
    /// The arena node ring no longer describes the configured region.
    #[error("arena node ring corrupted")]
    ArenaCorrupted,
    /// The hardware read pointer did not reach its target within the poll bound.
    #[error("hardware read pointer did not drain after {attempts} polls")]
    DrainTimeout { attempts: u32 },
}

/// Error returned by every playout operation.
///
/// `E` is the error type of the [`DeviceBus`](crate::bus::DeviceBus)
/// collaborator.
#[derive(Debug, Error)]
pub enum PlayoutError<E> {
    // ── Validation ─────────────────────────────────────────────────────
    #[error("buffer playout is disabled (max buffers is 0)")]
    FeatureDisabled,
    #[error("chip image does not support buffer playout")]
    ImageUnsupported,
    #[error("pattern is missing or shorter than the buffer size")]
    PatternMissing,
    #[error("buffer size {0} is below the minimum")]
    BufferSizeTooSmall(u32),
    #[error("buffer size {0} is not a multiple of the size granularity")]
    BufferSizeNotAligned(u32),
    #[error("buffer size {0} exceeds the maximum")]
    BufferSizeTooLarge(u32),
    #[error("invalid PCM law {0}")]
    InvalidLaw(u32),
    #[error("invalid playout port {0}")]
    InvalidPort(u32),
    #[error("invalid mixing mode {0}")]
    InvalidMixingMode(u32),
    #[error("gain {0} dB outside the accepted range")]
    GainOutOfRange(i32),
    #[error("invalid repeat count {0}")]
    InvalidRepeatCount(u32),
    #[error("invalid playout duration {0} ms")]
    InvalidDuration(u32),
    #[error("invalid play length {0}")]
    InvalidPlayLength(u32),
    #[error("buffer index {0} out of range")]
    BufferIndexOutOfRange(u32),
    #[error("buffer {0} is not loaded")]
    BufferNotOpen(u32),
    #[error("channel index {0} out of range")]
    ChannelIndexOutOfRange(u32),
    #[error("channel {0} is not open")]
    ChannelNotOpen(u32),
    #[error("channel handle {0:#010x} is stale")]
    StaleChannelHandle(u32),
    #[error("block offset {0} is odd")]
    BlockOffsetOdd(u32),
    #[error("block length {0} is odd")]
    BlockLengthOdd(u32),
    #[error("block {offset}+{length} exceeds buffer size {size}")]
    BlockOutOfBounds { offset: u32, length: u32, size: u32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    // ── Resource exhaustion ────────────────────────────────────────────
    #[error("all buffer slots are open")]
    AllBuffersOpen,
    #[error("not enough playout memory for {0} bytes")]
    OutOfMemory(u32),
    #[error("playout event ring is full")]
    EventBufferFull,

    // ── State conflict ─────────────────────────────────────────────────
    #[error("buffer {0} is still referenced by a playout port")]
    ActiveDependencies(u32),
    #[error("port already repeats a buffer indefinitely")]
    RepeatAlreadyUsed,
    #[error("channel is powered down")]
    ChannelPoweredDown,
    #[error("channel is frozen")]
    ChannelFrozen,
    #[error("NLP is disabled on the channel")]
    NlpDisabled,
    #[error("no buffer was added to the port since the last start")]
    NothingQueued,
    #[error("playout is still active on the port")]
    StillActive,
    #[error("channel {0} is already open")]
    ChannelAlreadyOpen(u32),

    // ── Collaborators and invariants ───────────────────────────────────
    #[error("device bus access failed: {0:?}")]
    Bus(E),
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
}

impl<E> PlayoutError<E> {
    /// `true` for errors that indicate a broken invariant or dead hardware.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlayoutError::Fatal(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E> = core::result::Result<T, PlayoutError<E>>;
