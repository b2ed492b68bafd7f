//! Per-reel sink: the collaborator that owns one reel's container files.
//!
//! The writer never knows how frames become MXF boxes or how captions become
//! XML; it only talks through [`ReelSink`]. A real implementation wraps the
//! DCP-format library; [`MemoryReelSink`] records everything in memory for
//! tests and dry runs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::digest::hash_bytes_chunked;
use crate::error::{Result, WriterError};
use crate::manifest::{ManifestFragment, ReelDigests};
use crate::queue::LastWritten;
use crate::time::DcpTimePeriod;
use crate::types::{AtmosFrame, AtmosMetadata, AudioBuffers, Eyes, Font, FontSet, TextSpan, TextType};

/// One contiguous time period of the output.
///
/// Never touched by more than one thread at a time: the single consumer
/// thread during encoding, one digest-pool thread afterwards.
pub trait ReelSink: Send {
    /// The half-open interval this reel covers. Contiguous across all reels.
    fn period(&self) -> DcpTimePeriod;

    /// Durably write a real encoded frame. `frame` is reel-relative.
    fn write_frame(&mut self, payload: &[u8], frame: i64, eyes: Eyes) -> Result<()>;

    /// Write a placeholder for a frame the container requires but that
    /// carries no real image.
    fn fake_write(&mut self, frame: i64, eyes: Eyes) -> Result<()>;

    /// Duplicate the previously-written frame for this eye.
    fn repeat_write(&mut self, frame: i64, eyes: Eyes) -> Result<()>;

    fn write_audio(&mut self, audio: &AudioBuffers) -> Result<()>;

    fn write_atmos(&mut self, frame: &AtmosFrame, metadata: &AtmosMetadata) -> Result<()>;

    fn write_text(
        &mut self,
        span: &TextSpan,
        kind: TextType,
        track: Option<&str>,
        period: DcpTimePeriod,
        fonts: &FontSet,
        fallback: Option<&Font>,
    ) -> Result<()>;

    /// First frame index this reel does not yet hold; frames below it exist
    /// from a previous run and may legally be faked or repeated.
    fn first_nonexistent_frame(&self) -> i64;

    /// Hash this reel's tracks, reporting byte progress in 0..=1 and polling
    /// `cancel` between chunks.
    fn calculate_digests(&mut self, set_progress: &dyn Fn(f32), cancel: &AtomicBool) -> Result<ReelDigests>;

    /// Finalize files under `output_dir` and produce this reel's manifest
    /// fragment.
    fn finish(&mut self, output_dir: &Path) -> Result<ManifestFragment>;
}

/// What a [`MemoryReelSink`] has been asked to write, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrittenKind {
    Full,
    Fake,
    Repeat,
}

#[derive(Debug, Clone)]
pub struct WrittenFrame {
    pub frame: i64,
    pub eyes: Eyes,
    pub kind: WrittenKind,
}

#[derive(Debug, Clone)]
pub struct RecordedText {
    pub text: String,
    pub kind: TextType,
    pub track: Option<String>,
    pub period: DcpTimePeriod,
    pub font_count: usize,
}

/// Everything a [`MemoryReelSink`] has recorded. Tests keep a handle to this
/// via [`MemoryReelSink::state_handle`] since the writer consumes the sink.
#[derive(Debug, Default)]
pub struct SinkState {
    pub frames: Vec<WrittenFrame>,
    pub picture_data: Vec<u8>,
    pub audio_frames: i64,
    pub audio_data: Vec<u8>,
    pub atmos_frames: i64,
    pub texts: Vec<RecordedText>,
    pub finished: bool,
}

/// In-memory reel sink that verifies the writer's ordering guarantee: frames
/// must arrive strictly in sequence per eye-track, starting at 0.
pub struct MemoryReelSink {
    period: DcpTimePeriod,
    stereoscopic: bool,
    cursor: LastWritten,
    /// Payload of the last real frame per eye, for repeats.
    last_payload: [Option<Vec<u8>>; 3],
    state: Arc<Mutex<SinkState>>,
}

impl MemoryReelSink {
    pub fn new(period: DcpTimePeriod, stereoscopic: bool) -> Self {
        MemoryReelSink {
            period,
            stereoscopic,
            cursor: LastWritten::new(),
            last_payload: [None, None, None],
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    /// Shared view of the recorded writes, usable after the sink is consumed.
    pub fn state_handle(&self) -> Arc<Mutex<SinkState>> {
        Arc::clone(&self.state)
    }

    fn eye_slot(eyes: Eyes) -> usize {
        match eyes {
            Eyes::Both => 0,
            Eyes::Left => 1,
            Eyes::Right => 2,
        }
    }

    fn check_sequence(&mut self, frame: i64, eyes: Eyes) -> Result<()> {
        if !self.cursor.next_is(frame, eyes) {
            return Err(WriterError::Sink(format!(
                "out-of-sequence write: got frame {} {} after frame {} {}",
                frame,
                eyes,
                self.cursor.frame(),
                self.cursor.eyes()
            )));
        }
        if self.stereoscopic == (eyes == Eyes::Both) {
            return Err(WriterError::Sink(format!("eye tag {} does not match reel geometry", eyes)));
        }
        self.cursor.advance(frame, eyes);
        Ok(())
    }

    /// Complete frames committed so far (eye pairs count once).
    fn frames_committed(&self) -> i64 {
        if self.stereoscopic {
            if self.cursor.eyes() == Eyes::Right { self.cursor.frame() + 1 } else { self.cursor.frame() }
        } else {
            self.cursor.frame() + 1
        }
    }
}

impl ReelSink for MemoryReelSink {
    fn period(&self) -> DcpTimePeriod {
        self.period
    }

    fn write_frame(&mut self, payload: &[u8], frame: i64, eyes: Eyes) -> Result<()> {
        self.check_sequence(frame, eyes)?;
        self.last_payload[Self::eye_slot(eyes)] = Some(payload.to_vec());
        let mut state = self.state.lock().unwrap();
        state.picture_data.extend_from_slice(payload);
        state.frames.push(WrittenFrame { frame, eyes, kind: WrittenKind::Full });
        Ok(())
    }

    fn fake_write(&mut self, frame: i64, eyes: Eyes) -> Result<()> {
        self.check_sequence(frame, eyes)?;
        self.last_payload[Self::eye_slot(eyes)] = None;
        let mut state = self.state.lock().unwrap();
        state.frames.push(WrittenFrame { frame, eyes, kind: WrittenKind::Fake });
        Ok(())
    }

    fn repeat_write(&mut self, frame: i64, eyes: Eyes) -> Result<()> {
        self.check_sequence(frame, eyes)?;
        let previous = self.last_payload[Self::eye_slot(eyes)]
            .clone()
            .ok_or_else(|| WriterError::Sink(format!("repeat of frame {} {} with no previous frame", frame, eyes)))?;
        let mut state = self.state.lock().unwrap();
        state.picture_data.extend_from_slice(&previous);
        state.frames.push(WrittenFrame { frame, eyes, kind: WrittenKind::Repeat });
        Ok(())
    }

    fn write_audio(&mut self, audio: &AudioBuffers) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.audio_frames += audio.frames() as i64;
        for sample in audio.data() {
            state.audio_data.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    fn write_atmos(&mut self, _frame: &AtmosFrame, _metadata: &AtmosMetadata) -> Result<()> {
        self.state.lock().unwrap().atmos_frames += 1;
        Ok(())
    }

    fn write_text(
        &mut self,
        span: &TextSpan,
        kind: TextType,
        track: Option<&str>,
        period: DcpTimePeriod,
        fonts: &FontSet,
        _fallback: Option<&Font>,
    ) -> Result<()> {
        self.state.lock().unwrap().texts.push(RecordedText {
            text: span.text.clone(),
            kind,
            track: track.map(str::to_string),
            period,
            font_count: fonts.len(),
        });
        Ok(())
    }

    fn first_nonexistent_frame(&self) -> i64 {
        self.frames_committed()
    }

    fn calculate_digests(&mut self, set_progress: &dyn Fn(f32), cancel: &AtomicBool) -> Result<ReelDigests> {
        if cancel.load(Ordering::Relaxed) {
            return Err(WriterError::Cancelled);
        }
        let state = self.state.lock().unwrap();
        let picture = hash_bytes_chunked(&state.picture_data, set_progress, cancel)?;
        let sound = if state.audio_frames > 0 {
            Some(hash_bytes_chunked(&state.audio_data, set_progress, cancel)?)
        } else {
            None
        };
        Ok(ReelDigests { picture, sound, text: None, atmos: None })
    }

    fn finish(&mut self, _output_dir: &Path) -> Result<ManifestFragment> {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        Ok(ManifestFragment {
            id: Uuid::new_v4(),
            period: self.period,
            duration_frames: self.frames_committed(),
            audio_frames: state.audio_frames,
            digests: None,
        })
    }
}
