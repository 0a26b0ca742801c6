/// Allocation granularity of the playout memory arena, in bytes.
///
/// Arena blocks and the "bytes used" statistic are both rounded to this unit.
pub const ARENA_GRANULARITY: u32 = 64;

/// Buffer sizes passed to a load must be a multiple of this many bytes.
pub const BUFFER_SIZE_GRANULARITY: u32 = 16;

/// Smallest buffer the hardware can play, in bytes.
pub const MIN_BUFFER_SIZE: u32 = 64;

/// Largest buffer the 23-bit play-length field can describe.
pub const MAX_BUFFER_SIZE: u32 = 0x007F_FFF0;

/// Maximum repeat count encodable in a single playout event.
pub const REPEAT_MAX: u32 = 32_767;

/// Bytes of companded audio per millisecond (8 kHz, one byte per sample).
pub const BYTES_PER_MS: u32 = 8;

/// Lowest accepted playout gain in dB.
pub const MIN_GAIN_DB: i32 = -24;

/// Highest accepted playout gain in dB.
pub const MAX_GAIN_DB: i32 = 24;

/// Size of one hardware playout event record, in bytes (four 32-bit words).
pub const EVENT_SIZE: u32 = 16;

/// Distance the legacy skip pointer trails the write pointer at start.
pub const SKIP_PTR_LAG: u32 = 63;

/// Modulus applied to the legacy skip pointer.
pub const SKIP_PTR_MODULUS: u32 = 128;

/// Mask of the 27-bit external-memory address carried in an event.
pub const ADDRESS_MASK: u32 = 0x07FF_FFFF;
