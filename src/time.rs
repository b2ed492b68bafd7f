//! DCP time arithmetic
//!
//! **Why**: Reel periods, audio splits and frame numbering all need exact
//! integer time math. Floating-point seconds drift; a single tick base that
//! every common edit rate and sample rate divides into does not.
//!
//! **Used by**: writer (reel lookup), audio (boundary splits), text (back-off)

use serde::{Deserialize, Serialize};

/// Ticks per second. 24, 25, 30, 48, 50, 60 fps and 48k/96k audio all divide
/// this evenly, so frame and sample positions stay exact.
pub const HZ: i64 = 96_000;

/// A point in package time, in ticks of 1/96000 s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DcpTime(pub i64);

impl DcpTime {
    pub const ZERO: DcpTime = DcpTime(0);

    pub const fn new(ticks: i64) -> Self {
        DcpTime(ticks)
    }

    /// Time of video frame `frame` at `rate` fps.
    pub fn from_frames(frame: i64, rate: u32) -> Self {
        DcpTime(frame * HZ / rate as i64)
    }

    /// Time of audio sample `sample` at `rate` Hz.
    pub fn from_samples(sample: i64, rate: u32) -> Self {
        DcpTime(sample * HZ / rate as i64)
    }

    pub fn from_seconds(s: f64) -> Self {
        DcpTime((s * HZ as f64).round() as i64)
    }

    pub fn seconds(self) -> f64 {
        self.0 as f64 / HZ as f64
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    /// Number of whole video frames at `rate` fps that fit before this time.
    pub fn frames_floor(self, rate: u32) -> i64 {
        (self.0 * rate as i64).div_euclid(HZ)
    }

    /// Number of video frames at `rate` fps needed to cover this time.
    pub fn frames_ceil(self, rate: u32) -> i64 {
        let n = self.0 * rate as i64;
        (n + HZ - 1).div_euclid(HZ)
    }

    /// Whole audio samples at `rate` Hz before this time.
    pub fn samples_floor(self, rate: u32) -> i64 {
        (self.0 * rate as i64).div_euclid(HZ)
    }

    /// Audio samples at `rate` Hz needed to cover this time.
    pub fn samples_ceil(self, rate: u32) -> i64 {
        let n = self.0 * rate as i64;
        (n + HZ - 1).div_euclid(HZ)
    }

    /// Duration of one video frame at `rate` fps.
    pub fn frame_interval(rate: u32) -> Self {
        DcpTime(HZ / rate as i64)
    }
}

impl std::ops::Add for DcpTime {
    type Output = DcpTime;
    fn add(self, rhs: DcpTime) -> DcpTime {
        DcpTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for DcpTime {
    type Output = DcpTime;
    fn sub(self, rhs: DcpTime) -> DcpTime {
        DcpTime(self.0 - rhs.0)
    }
}

impl std::fmt::Display for DcpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}s", self.seconds())
    }
}

/// Half-open interval `[from, to)` in package time.
///
/// Reels are contiguous and non-overlapping; together their periods cover the
/// whole output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DcpTimePeriod {
    pub from: DcpTime,
    pub to: DcpTime,
}

impl DcpTimePeriod {
    pub fn new(from: DcpTime, to: DcpTime) -> Self {
        DcpTimePeriod { from, to }
    }

    pub fn contains(&self, t: DcpTime) -> bool {
        self.from <= t && t < self.to
    }

    pub fn duration(&self) -> DcpTime {
        self.to - self.from
    }

    /// Intersection with `other`, or `None` if they do not overlap.
    pub fn overlap(&self, other: &DcpTimePeriod) -> Option<DcpTimePeriod> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        if from < to {
            Some(DcpTimePeriod { from, to })
        } else {
            None
        }
    }
}

impl std::fmt::Display for DcpTimePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversions() {
        let t = DcpTime::from_frames(24, 24);
        assert_eq!(t.ticks(), HZ);
        assert_eq!(t.frames_floor(24), 24);
        assert_eq!(t.frames_ceil(24), 24);

        // Half a frame in: floor stays, ceil rounds up
        let half = DcpTime(HZ / 48);
        assert_eq!(half.frames_floor(24), 0);
        assert_eq!(half.frames_ceil(24), 1);
    }

    #[test]
    fn test_sample_conversions() {
        let two_seconds = DcpTime::from_seconds(2.0);
        assert_eq!(two_seconds.samples_floor(48_000), 96_000);
        assert_eq!(two_seconds.samples_ceil(48_000), 96_000);
    }

    #[test]
    fn test_period_contains_half_open() {
        let p = DcpTimePeriod::new(DcpTime(0), DcpTime(HZ));
        assert!(p.contains(DcpTime(0)));
        assert!(p.contains(DcpTime(HZ - 1)));
        assert!(!p.contains(DcpTime(HZ)));
    }

    #[test]
    fn test_period_overlap() {
        let a = DcpTimePeriod::new(DcpTime(0), DcpTime(100));
        let b = DcpTimePeriod::new(DcpTime(50), DcpTime(150));
        let c = DcpTimePeriod::new(DcpTime(100), DcpTime(200));
        assert_eq!(a.overlap(&b), Some(DcpTimePeriod::new(DcpTime(50), DcpTime(100))));
        assert_eq!(a.overlap(&c), None);
    }
}
