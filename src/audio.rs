//! Reel routing for audio and immersive-audio data.
//!
//! Unlike video, audio and atmos arrive already time-ordered (a single feeder
//! produces them), so no reordering buffer exists here: just a monotonic
//! "current reel" cursor per stream and a split at each reel boundary.

use crate::error::{Result, WriterError};
use crate::time::{DcpTime, DcpTimePeriod};
use crate::types::AudioBuffers;

/// Routes channel-based audio to reels, splitting blocks that straddle a
/// boundary. The part before the boundary is rounded *up* to whole samples
/// and the remainder floored into the next reel, so the two parts always sum
/// to the input length.
#[derive(Debug)]
pub struct AudioRouter {
    periods: Vec<DcpTimePeriod>,
    sample_rate: u32,
    current_reel: usize,
}

impl AudioRouter {
    pub fn new(periods: Vec<DcpTimePeriod>, sample_rate: u32) -> Self {
        AudioRouter { periods, sample_rate, current_reel: 0 }
    }

    pub fn current_reel(&self) -> usize {
        self.current_reel
    }

    /// Deliver `audio` starting at `time`, calling `deliver(reel, part)` once
    /// per reel the block touches. The cursor only moves forward.
    pub fn route(
        &mut self,
        audio: AudioBuffers,
        time: DcpTime,
        mut deliver: impl FnMut(usize, AudioBuffers) -> Result<()>,
    ) -> Result<()> {
        let mut audio = audio;
        let mut time = time;

        while audio.frames() > 0 {
            while self.current_reel < self.periods.len() && time >= self.periods[self.current_reel].to {
                self.current_reel += 1;
            }
            let period = self.periods.get(self.current_reel).copied().ok_or_else(|| {
                WriterError::ContractViolation(format!("audio at {} falls beyond the last reel", time))
            })?;
            if time < period.from {
                return Err(WriterError::ContractViolation(format!(
                    "audio at {} arrived out of time order (current reel starts at {})",
                    time, period.from
                )));
            }

            // Samples that belong to this reel: round the boundary up.
            let fit = (period.to - time).samples_ceil(self.sample_rate).max(0) as usize;
            if fit >= audio.frames() {
                return deliver(self.current_reel, audio);
            }

            let (head, tail) = audio.split_at(fit);
            deliver(self.current_reel, head)?;
            audio = tail;
            time = period.to;
        }
        Ok(())
    }
}

/// Monotonic reel cursor for atmos frames; one frame is expected per video
/// frame interval, so no splitting is ever needed, only advancing.
#[derive(Debug)]
pub struct AtmosRouter {
    periods: Vec<DcpTimePeriod>,
    current_reel: usize,
}

impl AtmosRouter {
    pub fn new(periods: Vec<DcpTimePeriod>) -> Self {
        AtmosRouter { periods, current_reel: 0 }
    }

    /// Reel that the atmos frame at `time` belongs to, advancing past
    /// exhausted reels.
    pub fn route(&mut self, time: DcpTime) -> Result<usize> {
        while self.current_reel < self.periods.len() && time >= self.periods[self.current_reel].to {
            self.current_reel += 1;
        }
        let period = self.periods.get(self.current_reel).ok_or_else(|| {
            WriterError::ContractViolation(format!("atmos frame at {} falls beyond the last reel", time))
        })?;
        if time < period.from {
            return Err(WriterError::ContractViolation(format!(
                "atmos frame at {} arrived out of time order",
                time
            )));
        }
        Ok(self.current_reel)
    }
}
