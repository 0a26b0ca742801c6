//! Hardware playout event records.
//!
//! One event describes one playback segment and occupies four 32-bit words
//! of the port's event ring:
//!
//! | Word | Bits | Field |
//! |------|------|-------|
//! | 0 | 15:0 | repeat count (0 when repeating indefinitely) |
//! | 1 | 26:0 | buffer base address |
//! | 1 | 27 | PCM law (1 = A-law) |
//! | 1 | 28 | loop N times |
//! | 1 | 29 | repeat indefinitely |
//! | 1 | 31:30 | mixing mode |
//! | 2 | 22:0 | play length in bytes |
//! | 2 | 28:23 | gain mantissa |
//! | 2 | 31:29 | gain exponent |
//! | 3 | 0 | skip (extended images) |
//! | 3 | 1 | hard skip (extended images) |
//!
//! Gain is a 9-bit float: `(1 + m / 64) * 2^(e - 4)`, which spans
//! −24 dB to +24 dB.

use crate::buffer::PcmLaw;
use crate::constants::{
    ADDRESS_MASK, BUFFER_SIZE_GRANULARITY, BYTES_PER_MS, MIN_BUFFER_SIZE, REPEAT_MAX,
};
use crate::error::PlayoutError;

// ── Bit layout ─────────────────────────────────────────────────────────────

const W0_REPEAT_MASK: u32 = 0xFFFF;
const W1_ALAW: u32 = 1 << 27;
const W1_LOOP: u32 = 1 << 28;
pub(crate) const W1_REPEAT_FOREVER: u32 = 1 << 29;
const W1_MIXING_SHIFT: u32 = 30;
const W2_LENGTH_MASK: u32 = 0x007F_FFFF;
const W2_GAIN_SHIFT: u32 = 23;
pub(crate) const W3_SKIP: u32 = 1 << 0;
pub(crate) const W3_HARD_SKIP: u32 = 1 << 1;

/// Byte offset of word `n` inside an event record.
pub(crate) const fn word_offset(n: u32) -> u32 {
    n * 4
}

/// How a played buffer is combined with the port's signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingMode {
    /// Add the buffer to the signal.
    Mix = 0,
    /// Replace the signal with the buffer.
    Substitute = 1,
}

impl TryFrom<u32> for MixingMode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(MixingMode::Mix),
            1 => Ok(MixingMode::Substitute),
            other => Err(other),
        }
    }
}

/// Repetition requested for a buffer added to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Play the buffer once.
    Once,
    /// Play the buffer `n` times (`n >= 1`).
    Count(u32),
    /// Loop until the port is stopped.
    Forever,
    /// Loop for this many milliseconds, cutting the last pass short.
    Duration(u32),
}

// ── Gain encoding ──────────────────────────────────────────────────────────

/// Encode a gain in dB into the 9-bit event gain field.
pub fn encode_gain(db: i32) -> u16 {
    let linear = libm::powf(10.0, db as f32 / 20.0);
    let mut exponent = (libm::floorf(libm::log2f(linear)) as i32 + 4).clamp(0, 7);
    let scale = libm::ldexpf(1.0, exponent - 4);
    let mut mantissa = libm::roundf((linear / scale - 1.0) * 64.0) as i32;
    if mantissa >= 64 {
        if exponent < 7 {
            exponent += 1;
            mantissa = 0;
        } else {
            mantissa = 63;
        }
    }
    let mantissa = mantissa.clamp(0, 63);
    ((exponent as u16) << 6) | mantissa as u16
}

/// Linear gain represented by an encoded gain field.
pub fn decode_gain(code: u16) -> f32 {
    let exponent = ((code >> 6) & 7) as i32;
    let mantissa = (code & 63) as f32;
    libm::ldexpf(1.0 + mantissa / 64.0, exponent - 4)
}

// ── Event record ───────────────────────────────────────────────────────────

/// Decoded contents of one event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutEvent {
    pub repeat_count: u32,
    pub base_address: u32,
    pub law: PcmLaw,
    pub loop_n_times: bool,
    pub repeat_forever: bool,
    pub mixing: MixingMode,
    pub play_length: u32,
    pub gain: u16,
    pub skip: bool,
    pub hard_skip: bool,
}

impl PlayoutEvent {
    /// Build the event for one planned segment of a buffer.
    pub fn for_segment(
        segment: Segment,
        base_address: u32,
        law: PcmLaw,
        mixing: MixingMode,
        gain: u16,
    ) -> Self {
        let (repeat_count, loop_n_times, repeat_forever) = match segment.repeat {
            SegmentRepeat::Once => (1, false, false),
            SegmentRepeat::Times(n) => (n, true, false),
            SegmentRepeat::Forever => (0, false, true),
        };
        PlayoutEvent {
            repeat_count,
            base_address,
            law,
            loop_n_times,
            repeat_forever,
            mixing,
            play_length: segment.play_length,
            gain,
            skip: false,
            hard_skip: false,
        }
    }

    pub fn encode(&self) -> [u32; 4] {
        let mut w1 = self.base_address & ADDRESS_MASK;
        if self.law == PcmLaw::ALaw {
            w1 |= W1_ALAW;
        }
        if self.loop_n_times {
            w1 |= W1_LOOP;
        }
        if self.repeat_forever {
            w1 |= W1_REPEAT_FOREVER;
        }
        w1 |= (self.mixing as u32) << W1_MIXING_SHIFT;

        let w2 = (self.play_length & W2_LENGTH_MASK) | ((self.gain as u32 & 0x1FF) << W2_GAIN_SHIFT);

        let mut w3 = 0;
        if self.skip {
            w3 |= W3_SKIP;
        }
        if self.hard_skip {
            w3 |= W3_HARD_SKIP;
        }

        [self.repeat_count & W0_REPEAT_MASK, w1, w2, w3]
    }

    pub fn decode(words: [u32; 4]) -> Self {
        let [w0, w1, w2, w3] = words;
        PlayoutEvent {
            repeat_count: w0 & W0_REPEAT_MASK,
            base_address: w1 & ADDRESS_MASK,
            law: if w1 & W1_ALAW != 0 { PcmLaw::ALaw } else { PcmLaw::ULaw },
            loop_n_times: w1 & W1_LOOP != 0,
            repeat_forever: w1 & W1_REPEAT_FOREVER != 0,
            mixing: if (w1 >> W1_MIXING_SHIFT) & 3 == 0 {
                MixingMode::Mix
            } else {
                MixingMode::Substitute
            },
            play_length: w2 & W2_LENGTH_MASK,
            gain: (w2 >> W2_GAIN_SHIFT) as u16,
            skip: w3 & W3_SKIP != 0,
            hard_skip: w3 & W3_HARD_SKIP != 0,
        }
    }
}

// ── Event planning ─────────────────────────────────────────────────────────

/// Repetition of a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRepeat {
    Once,
    Times(u32),
    Forever,
}

/// One event worth of playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub repeat: SegmentRepeat,
    pub play_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    None,
    Once,
    Forever,
    /// Total passes, chained over as many events as `REPEAT_MAX` requires.
    Times(u32),
}

/// The events needed to satisfy one add request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPlan {
    body: Body,
    play_length: u32,
    /// Length of the trailing partial pass, if any.
    tail: Option<u32>,
}

impl EventPlan {
    /// Work out the events for playing `play_length` bytes of a buffer with
    /// the given repetition.
    pub fn new<E>(repeat: Repeat, play_length: u32) -> Result<Self, PlayoutError<E>> {
        if play_length == 0 {
            return Err(PlayoutError::InvalidPlayLength(0));
        }
        let (body, tail) = match repeat {
            Repeat::Once => (Body::Once, None),
            Repeat::Forever => (Body::Forever, None),
            Repeat::Count(0) => return Err(PlayoutError::InvalidRepeatCount(0)),
            Repeat::Count(n) => (Body::Times(n), None),
            Repeat::Duration(ms) => {
                let total = match ms.checked_mul(BYTES_PER_MS) {
                    Some(total) if total > 0 => total,
                    _ => return Err(PlayoutError::InvalidDuration(ms)),
                };
                let passes = total / play_length;
                let remainder = total % play_length;
                let body = if passes == 0 { Body::None } else { Body::Times(passes) };
                (body, (remainder != 0).then(|| tail_length(remainder, play_length)))
            }
        };
        Ok(EventPlan {
            body,
            play_length,
            tail,
        })
    }

    /// Number of events the plan writes.
    pub fn len(&self) -> u32 {
        let body = match self.body {
            Body::None => 0,
            Body::Once | Body::Forever => 1,
            Body::Times(n) => n.div_ceil(REPEAT_MAX),
        };
        body + self.tail.is_some() as u32
    }

    /// Whether the plan loops until stopped.
    pub fn is_forever(&self) -> bool {
        self.body == Body::Forever
    }

    /// The events in playback order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        let play_length = self.play_length;
        let mut remaining = match self.body {
            Body::Times(n) => n,
            _ => 0,
        };
        let mut head = match self.body {
            Body::Once => Some(SegmentRepeat::Once),
            Body::Forever => Some(SegmentRepeat::Forever),
            _ => None,
        };
        let mut tail = self.tail;
        core::iter::from_fn(move || {
            if let Some(repeat) = head.take() {
                return Some(Segment { repeat, play_length });
            }
            if remaining > 0 {
                let n = remaining.min(REPEAT_MAX);
                remaining -= n;
                return Some(Segment {
                    repeat: SegmentRepeat::Times(n),
                    play_length,
                });
            }
            tail.take().map(|length| Segment {
                repeat: SegmentRepeat::Once,
                play_length: length,
            })
        })
    }
}

/// Round a partial pass down to the size granularity. A remainder shorter
/// than one granule still plays, at the minimum buffer size.
fn tail_length(remainder: u32, play_length: u32) -> u32 {
    let rounded = remainder / BUFFER_SIZE_GRANULARITY * BUFFER_SIZE_GRANULARITY;
    let length = if rounded == 0 { MIN_BUFFER_SIZE } else { rounded };
    length.min(play_length)
}
