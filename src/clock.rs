//! Media clock for RTP timestamp derivation.
//!
//! AppleMIDI sessions run on a nominal 10 kHz media clock. The clock is
//! anchored at session start and only ever moves forward; the 32-bit RTP
//! timestamp field carries the low 32 bits of the tick count.

use tokio::time::Instant;

/// Monotonic media clock ticking at the session sample rate.
#[derive(Debug, Clone)]
pub struct MediaClock {
    start: Instant,
    rate: u32,
}

impl MediaClock {
    /// Default AppleMIDI clock rate in Hz.
    pub const DEFAULT_RATE: u32 = 10_000;

    /// Start a clock at the given rate, anchored to now.
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self {
            start: Instant::now(),
            rate,
        }
    }

    /// Clock rate in Hz.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Current tick count: `elapsed_ms * rate / 1000`.
    #[must_use]
    pub fn now(&self) -> i64 {
        let elapsed_ms = self.start.elapsed().as_millis() as i64;
        elapsed_ms * i64::from(self.rate) / 1000
    }

    /// Low 32 bits of the tick count, as carried in the RTP header.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rtp_timestamp(&self) -> u32 {
        self.now() as u32
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RATE)
    }
}
