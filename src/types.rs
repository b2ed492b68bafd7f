//! Shared vocabulary for the writer: eye tags, audio/atmos/text payloads, fonts.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stereoscopic channel tag. `Both` means monoscopic (2D) material.
///
/// Ordering matters: within one frame index, `Left` sorts before `Right` so
/// the queue drains eye pairs in the order the container expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Eyes {
    Both,
    Left,
    Right,
}

impl Eyes {
    /// Single-character tag used in spill file names and logs.
    pub fn tag(self) -> char {
        match self {
            Eyes::Both => 'b',
            Eyes::Left => 'l',
            Eyes::Right => 'r',
        }
    }
}

impl std::fmt::Display for Eyes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eyes::Both => write!(f, "both"),
            Eyes::Left => write!(f, "left"),
            Eyes::Right => write!(f, "right"),
        }
    }
}

/// Kind of timed-text track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextType {
    OpenSubtitle,
    ClosedCaption,
}

impl std::fmt::Display for TextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextType::OpenSubtitle => write!(f, "open-subtitle"),
            TextType::ClosedCaption => write!(f, "closed-caption"),
        }
    }
}

/// Interleaved-channel audio block.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffers {
    channels: usize,
    data: Vec<f32>,
}

impl AudioBuffers {
    /// `data.len()` must be a multiple of `channels`.
    pub fn new(channels: usize, data: Vec<f32>) -> Self {
        assert!(channels > 0, "audio needs at least one channel");
        assert!(
            data.len() % channels == 0,
            "interleaved audio length {} is not a multiple of {} channels",
            data.len(),
            channels
        );
        AudioBuffers { channels, data }
    }

    /// Silent block of `frames` sample-frames.
    pub fn silent(channels: usize, frames: usize) -> Self {
        AudioBuffers {
            channels,
            data: vec![0.0; channels * frames],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of sample-frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.data.len() / self.channels
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Split into `[0, frame)` and `[frame, len)`. `frame` is clamped to the
    /// buffer length, so the two halves always sum to the original.
    pub fn split_at(&self, frame: usize) -> (AudioBuffers, AudioBuffers) {
        let cut = frame.min(self.frames()) * self.channels;
        (
            AudioBuffers {
                channels: self.channels,
                data: self.data[..cut].to_vec(),
            },
            AudioBuffers {
                channels: self.channels,
                data: self.data[cut..].to_vec(),
            },
        )
    }
}

/// One frame of object-based immersive audio. The payload is opaque to the
/// writer; only the reel routing is our business.
#[derive(Debug, Clone)]
pub struct AtmosFrame {
    pub data: Vec<u8>,
}

/// Stream-level immersive-audio metadata the sink needs to open its asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtmosMetadata {
    pub stream_id: Uuid,
    /// First frame number carried by the stream.
    pub first_frame: i64,
    /// Atmos frames per second; one is expected per video frame interval.
    pub frame_rate: u32,
}

/// A piece of rendered subtitle/caption content. Timing travels separately
/// (as a [`crate::time::DcpTimePeriod`]) so boundary splitting can rewrite it
/// without touching the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub text: String,
}

impl TextSpan {
    pub fn new(text: impl Into<String>) -> Self {
        TextSpan { text: text.into() }
    }
}

/// A font resource to embed with a text track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Font {
    pub id: String,
    pub data: Vec<u8>,
}

/// Fonts keyed by id, first-insertion order preserved, duplicates dropped.
#[derive(Debug, Clone, Default)]
pub struct FontSet {
    fonts: IndexMap<String, Font>,
}

impl FontSet {
    pub fn new() -> Self {
        FontSet::default()
    }

    /// Insert, deduplicating by id. Returns false if the id was already known.
    pub fn insert(&mut self, font: Font) -> bool {
        if self.fonts.contains_key(&font.id) {
            return false;
        }
        self.fonts.insert(font.id.clone(), font);
        true
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Font> {
        self.fonts.values()
    }

    /// First font in insertion order, used as the fallback for unstyled text.
    pub fn first(&self) -> Option<&Font> {
        self.fonts.values().next()
    }

    /// Collapse every font under the first id. Formats that only allow a
    /// single embedded font declaration (interop) get exactly one entry; the
    /// limitation is surfaced here rather than hidden in the sink.
    pub fn coalesced(&self) -> FontSet {
        let mut out = FontSet::new();
        if let Some(first) = self.fonts.values().next() {
            out.insert(first.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eyes_ordering() {
        assert!(Eyes::Left < Eyes::Right);
    }

    #[test]
    fn test_audio_split_lengths_sum() {
        let buf = AudioBuffers::silent(2, 100);
        let (a, b) = buf.split_at(33);
        assert_eq!(a.frames(), 33);
        assert_eq!(b.frames(), 67);
        assert_eq!(a.channels(), 2);

        // Clamped split
        let (a, b) = buf.split_at(500);
        assert_eq!(a.frames(), 100);
        assert_eq!(b.frames(), 0);
    }

    #[test]
    fn test_font_set_dedup_and_coalesce() {
        let mut set = FontSet::new();
        assert!(set.insert(Font { id: "main".into(), data: vec![1] }));
        assert!(!set.insert(Font { id: "main".into(), data: vec![2] }));
        assert!(set.insert(Font { id: "italic".into(), data: vec![3] }));
        assert_eq!(set.len(), 2);

        let one = set.coalesced();
        assert_eq!(one.len(), 1);
        assert_eq!(one.first().unwrap().id, "main");
        assert_eq!(one.first().unwrap().data, vec![1]);
    }
}
