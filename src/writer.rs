//! The writer core: many producers, one ordered consumer, bounded memory.
//!
//! N encoding threads call [`Writer::write`]/[`Writer::repeat`]/
//! [`Writer::fake_write`] in whatever order their frames complete. Items land
//! in the frame queue; a single consumer thread pops them once a contiguous
//! run is available for a reel and forwards them to that reel's sink. When
//! the in-memory FULL count exceeds the configured bound the consumer spills
//! payloads from the queue tail to temp storage and producers block until
//! there is headroom again.
//!
//! **Used by**: the encoding orchestrator; one `Writer` per output package.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::audio::{AtmosRouter, AudioRouter};
use crate::config::WriterConfig;
use crate::digest;
use crate::error::{Result, WriterError};
use crate::manifest::{PackageManifest, PackageMetadata, ReferencedAsset};
use crate::progress::Progress;
use crate::queue::{FrameQueue, LastWritten, QueueItem, QueueKind};
use crate::sink::ReelSink;
use crate::spill::SpillStore;
use crate::time::{DcpTime, DcpTimePeriod};
use crate::types::{AtmosFrame, AtmosMetadata, AudioBuffers, Eyes, Font, TextSpan, TextType};

/// Consumer state machine. `Zombie` is reachable from anywhere and turns all
/// producer calls into no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    FinishRequested,
    Draining,
    Stopped,
    Zombie,
}

/// Counters reported in the finish summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub full_written: u64,
    pub fake_written: u64,
    pub repeat_written: u64,
    pub spilled: u64,
    /// Items discarded at finish because a gap never filled.
    pub leftover: u64,
}

/// Everything behind the writer's one lock.
struct Shared {
    queue: FrameQueue,
    cursors: Vec<LastWritten>,
    state: State,
    /// First consumer-side failure; surfaced by `finish`.
    fatal: Option<WriterError>,
    stats: WriterStats,
}

struct Inner {
    cfg: WriterConfig,
    periods: Vec<DcpTimePeriod>,
    sinks: Vec<Arc<Mutex<Box<dyn ReelSink>>>>,
    shared: Mutex<Shared>,
    /// Producers wait here for memory/queue headroom.
    not_full: Condvar,
    /// The consumer waits here for something to do.
    ready: Condvar,
    spill: SpillStore,
    progress: Arc<dyn Progress>,
    /// Total queue items expected over the whole job, for the progress fraction.
    expected_items: u64,
    digest_cancel: Arc<AtomicBool>,
}

/// Result of a successful [`Writer::finish`].
#[derive(Debug)]
pub struct FinishedPackage {
    pub manifest: PackageManifest,
    pub stats: WriterStats,
}

pub struct Writer {
    inner: Arc<Inner>,
    thread: Option<thread::JoinHandle<()>>,
    audio: Mutex<AudioRouter>,
    atmos: Mutex<AtmosRouter>,
    text: Mutex<crate::text::TextRouter>,
    referenced: Mutex<Vec<ReferencedAsset>>,
    metadata: Mutex<PackageMetadata>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl Writer {
    /// Validates the reel layout and signing identity, then starts the
    /// consumer thread.
    pub fn new(
        cfg: WriterConfig,
        sinks: Vec<Box<dyn ReelSink>>,
        progress: Arc<dyn Progress>,
    ) -> Result<Writer> {
        if sinks.is_empty() {
            return Err(WriterError::ContractViolation("a package needs at least one reel".into()));
        }
        if let Some(signing) = &cfg.signing {
            signing.validate()?;
        }

        let periods: Vec<DcpTimePeriod> = sinks.iter().map(|s| s.period()).collect();
        for pair in periods.windows(2) {
            if pair[0].to != pair[1].from {
                return Err(WriterError::ContractViolation(format!(
                    "reel periods are not contiguous: {} then {}",
                    pair[0], pair[1]
                )));
            }
        }
        for p in &periods {
            if p.duration().ticks() <= 0 {
                return Err(WriterError::ContractViolation(format!("empty reel period {}", p)));
            }
        }

        let total_frames: i64 = periods.iter().map(|p| p.duration().frames_floor(cfg.frame_rate)).sum();
        let expected_items = total_frames as u64 * if cfg.stereoscopic { 2 } else { 1 };

        let spill = match &cfg.spill_dir {
            Some(dir) => SpillStore::with_dir(dir)?,
            None => SpillStore::new()?,
        };

        let reel_count = sinks.len();
        let sinks: Vec<Arc<Mutex<Box<dyn ReelSink>>>> =
            sinks.into_iter().map(|s| Arc::new(Mutex::new(s))).collect();

        let audio = AudioRouter::new(periods.clone(), cfg.audio_sample_rate);
        let atmos = AtmosRouter::new(periods.clone());
        let text = crate::text::TextRouter::new(periods.clone(), cfg.frame_rate, cfg.interop);

        let inner = Arc::new(Inner {
            periods,
            sinks,
            shared: Mutex::new(Shared {
                queue: FrameQueue::new(),
                cursors: vec![LastWritten::new(); reel_count],
                state: State::Running,
                fatal: None,
                stats: WriterStats::default(),
            }),
            not_full: Condvar::new(),
            ready: Condvar::new(),
            spill,
            progress: Arc::clone(&progress),
            expected_items,
            digest_cancel: Arc::new(AtomicBool::new(false)),
            cfg,
        });

        let thread = thread::Builder::new().name("reelpack-writer".into()).spawn({
            let inner = Arc::clone(&inner);
            move || consumer_thread(inner)
        })?;

        info!(
            "writer started: {} reels, {} frames expected, memory bound {} frames",
            reel_count,
            total_frames,
            inner.cfg.max_full_in_memory()
        );
        progress.sub("Encoding image data");

        Ok(Writer {
            inner,
            thread: Some(thread),
            audio: Mutex::new(audio),
            atmos: Mutex::new(atmos),
            text: Mutex::new(text),
            referenced: Mutex::new(Vec::new()),
            metadata: Mutex::new(PackageMetadata::default()),
        })
    }

    /// The eyes tag must match the package geometry. A mismatch means the
    /// caller and the encoder disagree about what is being built, which would
    /// corrupt every subsequent reel, so this is a programming error and not
    /// a recoverable condition.
    fn check_eyes(&self, eyes: Eyes) {
        if self.inner.cfg.stereoscopic {
            assert!(eyes != Eyes::Both, "monoscopic frame submitted to a stereoscopic output");
        } else {
            assert!(eyes == Eyes::Both, "eye-tagged frame submitted to a monoscopic output");
        }
    }

    /// Translate a global frame number to `(reel, intra-reel frame)`.
    fn locate(&self, global_frame: i64) -> Result<(usize, i64)> {
        let origin = self.inner.periods[0].from;
        let t = DcpTime::from_frames(global_frame, self.inner.cfg.frame_rate) + origin;
        for (i, p) in self.inner.periods.iter().enumerate() {
            if p.contains(t) {
                let reel_start = (p.from - origin).frames_floor(self.inner.cfg.frame_rate);
                return Ok((i, global_frame - reel_start));
            }
        }
        Err(WriterError::ContractViolation(format!(
            "frame {} falls outside every reel period",
            global_frame
        )))
    }

    /// Queue a real encoded frame. Blocks while the in-memory FULL count is
    /// over the configured bound. No-op once the writer is a zombie.
    pub fn write(&self, payload: Vec<u8>, global_frame: i64, eyes: Eyes) -> Result<()> {
        self.check_eyes(eyes);
        let (reel, frame) = self.locate(global_frame)?;

        let mut shared = self.inner.shared.lock().unwrap();
        loop {
            match shared.state {
                State::Zombie => return Ok(()),
                State::Stopped | State::Draining => return Err(WriterError::Zombie),
                State::Running | State::FinishRequested => {}
            }
            if shared.queue.full_in_memory() <= self.inner.cfg.max_full_in_memory() {
                break;
            }
            shared = self.inner.not_full.wait(shared).unwrap();
        }
        shared.queue.push(QueueItem { reel, frame, eyes, kind: QueueKind::Full(Some(payload)) });
        drop(shared);
        self.inner.ready.notify_all();
        Ok(())
    }

    /// True if `repeat` is legal for this frame: the reel must hold a frame
    /// before this index, written either by this run or by a previous
    /// interrupted one.
    pub fn can_repeat(&self, global_frame: i64) -> bool {
        match self.locate(global_frame) {
            Ok((reel, frame)) => {
                frame > 0
                    || self.inner.sinks[reel].lock().unwrap().first_nonexistent_frame() > frame
            }
            Err(_) => false,
        }
    }

    /// Queue a duplicate of the previous frame. Blocks while the queue is
    /// over its length cap and nothing is drainable.
    pub fn repeat(&self, global_frame: i64, eyes: Eyes) -> Result<()> {
        self.check_eyes(eyes);
        let (reel, frame) = self.locate(global_frame)?;
        if frame == 0 && self.inner.sinks[reel].lock().unwrap().first_nonexistent_frame() == 0 {
            return Err(WriterError::ContractViolation(format!(
                "frame {} is the first of reel {}; there is nothing to repeat",
                global_frame, reel
            )));
        }
        self.push_unpayloaded(QueueItem { reel, frame, eyes, kind: QueueKind::Repeat })
    }

    /// Queue a placeholder frame. Illegal for frame 0 of a reel (the sink
    /// needs a real first frame to initialize per-reel encoding parameters)
    /// and for encrypted outputs (frame identity is folded into integrity
    /// codes, so a faked frame could never be swapped for a real one later).
    pub fn fake_write(&self, global_frame: i64, eyes: Eyes) -> Result<()> {
        self.check_eyes(eyes);
        if self.inner.cfg.encrypted {
            return Err(WriterError::ContractViolation(
                "cannot fake-write frames of an encrypted output".into(),
            ));
        }
        let (reel, frame) = self.locate(global_frame)?;
        if frame == 0 {
            return Err(WriterError::ContractViolation(format!(
                "cannot fake-write frame {}: it is frame 0 of reel {}",
                global_frame, reel
            )));
        }
        self.push_unpayloaded(QueueItem { reel, frame, eyes, kind: QueueKind::Fake })
    }

    /// Shared enqueue path for REPEAT/FAKE items: bounded by overall queue
    /// length rather than the FULL memory cap.
    fn push_unpayloaded(&self, item: QueueItem) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        loop {
            match shared.state {
                State::Zombie => return Ok(()),
                State::Stopped | State::Draining => return Err(WriterError::Zombie),
                State::Running | State::FinishRequested => {}
            }
            if shared.queue.len() < self.inner.cfg.max_queue_len() {
                break;
            }
            shared.queue.sort();
            if shared.queue.ready_head(&shared.cursors) {
                // Consumer is about to make room; no point sleeping.
                break;
            }
            shared = self.inner.not_full.wait(shared).unwrap();
        }
        shared.queue.push(item);
        drop(shared);
        self.inner.ready.notify_all();
        Ok(())
    }

    /// Write channel audio starting at `time`, splitting at reel boundaries.
    /// Audio is assumed to arrive in time order from a single feeder.
    pub fn write_audio(&self, audio: AudioBuffers, time: DcpTime) -> Result<()> {
        if self.is_zombie() {
            return Ok(());
        }
        let sinks = &self.inner.sinks;
        self.audio.lock().unwrap().route(audio, time, |reel, part| {
            trace!("audio: {} frames to reel {}", part.frames(), reel);
            sinks[reel].lock().unwrap().write_audio(&part)
        })
    }

    /// Write one immersive-audio frame; one is expected per video frame
    /// interval, in time order.
    pub fn write_atmos(&self, frame: AtmosFrame, time: DcpTime, metadata: &AtmosMetadata) -> Result<()> {
        if self.is_zombie() {
            return Ok(());
        }
        let reel = self.atmos.lock().unwrap().route(time)?;
        self.inner.sinks[reel].lock().unwrap().write_atmos(&frame, metadata)
    }

    /// Write a subtitle/caption span covering `period`. Spans crossing a reel
    /// boundary are truncated (with a two-frame back-off) and the remainder
    /// deferred until the later reel opens.
    pub fn write_text(
        &self,
        span: TextSpan,
        kind: TextType,
        track: Option<String>,
        period: DcpTimePeriod,
    ) -> Result<()> {
        if self.is_zombie() {
            return Ok(());
        }
        let sinks = &self.inner.sinks;
        self.text.lock().unwrap().route(span, kind, track, period, &mut |reel, s, k, tr, p, fonts, fallback| {
            sinks[reel].lock().unwrap().write_text(s, k, tr, p, fonts, fallback)
        })
    }

    /// Record fonts to embed, deduplicated by id. For interop targets all
    /// fonts are coalesced under a single id at delivery time.
    pub fn write_fonts(&self, fonts: Vec<Font>) {
        if self.is_zombie() {
            return;
        }
        self.text.lock().unwrap().add_fonts(fonts);
    }

    /// Register an asset referenced by the package but produced elsewhere; it
    /// participates in the digest pass.
    pub fn add_referenced_asset(&self, asset: ReferencedAsset) {
        self.referenced.lock().unwrap().push(asset);
    }

    pub fn set_metadata(&self, metadata: PackageMetadata) {
        *self.metadata.lock().unwrap() = metadata;
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.shared.lock().unwrap().stats.clone()
    }

    fn is_zombie(&self) -> bool {
        self.inner.shared.lock().unwrap().state == State::Zombie
    }

    /// Abort: clear the queue, mark the writer dead, and turn every further
    /// producer call into a no-op so in-flight encoder threads can finish
    /// without crashing. There is no way back; `finish` will fail afterwards.
    pub fn zombify(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        let dropped = shared.queue.clear();
        if !dropped.is_empty() {
            warn!("zombify drops {} queued items", dropped.len());
        }
        shared.state = State::Zombie;
        drop(shared);
        self.inner.digest_cancel.store(true, Ordering::Relaxed);
        self.inner.ready.notify_all();
        self.inner.not_full.notify_all();
    }

    /// Cooperatively cancel the digest pass (the only long phase of
    /// `finish`). Hashing aborts between chunks; written output is untouched.
    pub fn cancel_digests(&self) {
        self.inner.digest_cancel.store(true, Ordering::Relaxed);
    }

    /// Stop the consumer, flush deferred text, finalize every reel, hash the
    /// outputs and assemble the manifest plus a human-readable summary.
    ///
    /// An invalid signing identity aborts before any manifest bytes are
    /// written.
    pub fn finish(&mut self, output_dir: &Path) -> Result<FinishedPackage> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.state == State::Running {
                shared.state = State::FinishRequested;
            }
        }
        self.inner.ready.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Err(WriterError::Sink("writer consumer thread panicked".into()));
            }
        }

        let (stats, fatal, state) = {
            let mut shared = self.inner.shared.lock().unwrap();
            (shared.stats.clone(), shared.fatal.take(), shared.state)
        };
        if let Some(e) = fatal {
            return Err(e);
        }
        if state == State::Zombie {
            return Err(WriterError::Zombie);
        }

        // Signer first: nothing gets assembled with an identity the signing
        // collaborator would reject.
        if let Some(signing) = &self.inner.cfg.signing {
            signing.validate()?;
        }

        std::fs::create_dir_all(output_dir)?;

        let sinks = &self.inner.sinks;
        {
            let mut text = self.text.lock().unwrap();
            if text.pending_len() > 0 {
                debug!("flushing {} deferred text fragments", text.pending_len());
            }
            text.flush_all(&mut |reel, s, k, tr, p, fonts, fallback| {
                sinks[reel].lock().unwrap().write_text(s, k, tr, p, fonts, fallback)
            })?;
        }

        let mut fragments = Vec::new();
        for sink in sinks {
            fragments.push(sink.lock().unwrap().finish(output_dir)?);
        }

        self.inner.progress.sub("Computing digests");
        let mut referenced = std::mem::take(&mut *self.referenced.lock().unwrap());
        let reel_digests = digest::run_digest_pass(
            self.inner.cfg.threads,
            sinks,
            &mut referenced,
            &self.inner.progress,
            Arc::clone(&self.inner.digest_cancel),
        )?;
        for (fragment, digests) in fragments.iter_mut().zip(reel_digests) {
            fragment.digests = Some(digests);
        }

        let mut manifest =
            PackageManifest::new(&self.inner.cfg.content_title, self.metadata.lock().unwrap().clone());
        if let Some(signing) = &self.inner.cfg.signing {
            manifest.signer_thumbprint = Some(signing.thumbprint()?);
        }
        manifest.reels = fragments;
        manifest.referenced_assets = referenced;
        manifest.write(output_dir)?;

        let stats_line = format!(
            "Wrote {} FULL, {} FAKE, {} REPEAT; {} pushed to disk; {} leftover",
            stats.full_written, stats.fake_written, stats.repeat_written, stats.spilled, stats.leftover
        );
        manifest.write_summary(output_dir, &stats_line)?;
        info!("{}", stats_line);
        self.inner.progress.set_progress(1.0);

        Ok(FinishedPackage { manifest, stats })
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.zombify();
            let _ = thread.join();
        }
    }
}

/// Forward one popped item to its sink. Runs with the writer lock released.
fn dispatch(inner: &Inner, item: QueueItem) -> Result<()> {
    let sink = &inner.sinks[item.reel];
    match item.kind {
        QueueKind::Full(payload) => {
            let bytes = match payload {
                Some(bytes) => bytes,
                None => inner.spill.recover(item.reel, item.frame, item.eyes)?,
            };
            trace!("FULL-write reel {} frame {} {}", item.reel, item.frame, item.eyes);
            sink.lock().unwrap().write_frame(&bytes, item.frame, item.eyes)
        }
        QueueKind::Fake => {
            trace!("FAKE-write reel {} frame {} {}", item.reel, item.frame, item.eyes);
            sink.lock().unwrap().fake_write(item.frame, item.eyes)
        }
        QueueKind::Repeat => {
            trace!("REPEAT-write reel {} frame {} {}", item.reel, item.frame, item.eyes);
            sink.lock().unwrap().repeat_write(item.frame, item.eyes)
        }
    }
}

/// Record a consumer-side failure and kill the writer: the queue is cleared,
/// producers become no-ops, and `finish` reports the error.
fn fail(inner: &Inner, shared: &mut Shared, e: WriterError) {
    error!("writer consumer failed: {}", e);
    shared.queue.clear();
    if shared.fatal.is_none() {
        shared.fatal = Some(e);
    }
    shared.state = State::Zombie;
    inner.not_full.notify_all();
    inner.ready.notify_all();
}

fn consumer_thread(inner: Arc<Inner>) {
    let max_full = inner.cfg.max_full_in_memory();

    loop {
        let mut shared = inner.shared.lock().unwrap();

        // Wait until there is something to do.
        loop {
            shared.queue.sort();
            match shared.state {
                State::Zombie | State::Stopped => return,
                State::FinishRequested | State::Draining => break,
                State::Running => {}
            }
            if shared.queue.full_in_memory() > max_full || shared.queue.ready_head(&shared.cursors) {
                break;
            }
            trace!("writer sleeps with a queue of {}", shared.queue.len());
            shared = inner.ready.wait(shared).unwrap();
        }

        let finishing = matches!(shared.state, State::FinishRequested | State::Draining);
        if finishing {
            shared.state = State::Draining;
            if !shared.queue.ready_head(&shared.cursors) {
                // The ordered drain is over. Anything still queued is a gap
                // left by a dead or late producer; blocking for it would hang
                // finish forever, so log loudly and discard.
                let leftovers = shared.queue.clear();
                shared.stats.leftover = leftovers.len() as u64;
                for item in &leftovers {
                    error!(
                        "discarding leftover queue item: {} reel {} frame {} {}",
                        item.kind.name(),
                        item.reel,
                        item.frame,
                        item.eyes
                    );
                }
                shared.state = State::Stopped;
                drop(shared);
                inner.not_full.notify_all();
                return;
            }
        }

        // Drain every consecutively-ready item.
        loop {
            shared.queue.sort();
            if !shared.queue.ready_head(&shared.cursors) {
                break;
            }
            let item = shared.queue.pop_ready();
            shared.cursors[item.reel].advance(item.frame, item.eyes);
            match item.kind {
                QueueKind::Full(_) => shared.stats.full_written += 1,
                QueueKind::Fake => shared.stats.fake_written += 1,
                QueueKind::Repeat => shared.stats.repeat_written += 1,
            }
            let written =
                shared.stats.full_written + shared.stats.fake_written + shared.stats.repeat_written;

            drop(shared);
            let result = dispatch(&inner, item);
            if inner.expected_items > 0 {
                inner.progress.set_progress(written as f32 / inner.expected_items as f32);
            }
            shared = inner.shared.lock().unwrap();

            if let Err(e) = result {
                fail(&inner, &mut shared, e);
                return;
            }
            inner.not_full.notify_all();
        }

        // Still over the memory bound: push payloads from the queue tail
        // (least likely to be needed soon) out to temp storage.
        while shared.queue.full_in_memory() > max_full {
            let Some(idx) = shared.queue.spill_candidate() else {
                break;
            };
            let Some((reel, frame, eyes, payload)) = shared.queue.take_payload(idx) else {
                break;
            };
            shared.stats.spilled += 1;
            debug!(
                "queue over memory bound ({} resident); spilling reel {} frame {} {} to disk",
                shared.queue.full_in_memory() + 1,
                reel,
                frame,
                eyes
            );
            drop(shared);
            let result = inner.spill.store(reel, frame, eyes, &payload);
            shared = inner.shared.lock().unwrap();
            if let Err(e) = result {
                // A failed spill write must kill the job; dropping the frame
                // silently would corrupt the reel.
                fail(&inner, &mut shared, e.into());
                return;
            }
            inner.not_full.notify_all();
        }

        drop(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::test_identity;
    use crate::progress::NullProgress;
    use crate::sink::{MemoryReelSink, SinkState, WrittenKind};
    use crate::time::HZ;

    fn reel_periods(count: usize, frames_each: i64, rate: u32) -> Vec<DcpTimePeriod> {
        (0..count as i64)
            .map(|i| {
                DcpTimePeriod::new(
                    DcpTime::from_frames(i * frames_each, rate),
                    DcpTime::from_frames((i + 1) * frames_each, rate),
                )
            })
            .collect()
    }

    fn build(
        cfg: WriterConfig,
        reels: usize,
        frames_each: i64,
    ) -> (Writer, Vec<Arc<Mutex<SinkState>>>) {
        let stereoscopic = cfg.stereoscopic;
        let mut sinks: Vec<Box<dyn ReelSink>> = Vec::new();
        let mut handles = Vec::new();
        for period in reel_periods(reels, frames_each, cfg.frame_rate) {
            let sink = MemoryReelSink::new(period, stereoscopic);
            handles.push(sink.state_handle());
            sinks.push(Box::new(sink));
        }
        let writer = Writer::new(cfg, sinks, Arc::new(NullProgress)).unwrap();
        (writer, handles)
    }

    fn small_cfg() -> WriterConfig {
        WriterConfig { threads: 2, memory_multiplier: 2, ..Default::default() }
    }

    #[test]
    fn test_out_of_order_single_thread() {
        let (mut writer, handles) = build(small_cfg(), 1, 8);
        for frame in [3, 0, 2, 1, 5, 4, 7, 6] {
            writer.write(vec![frame as u8], frame, Eyes::Both).unwrap();
        }
        let finished = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(finished.stats.full_written, 8);
        assert_eq!(finished.stats.leftover, 0);

        let state = handles[0].lock().unwrap();
        let frames: Vec<i64> = state.frames.iter().map(|f| f.frame).collect();
        assert_eq!(frames, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_frames_spill_under_memory_pressure() {
        // Memory bound of 1 FULL frame; frame 0 withheld so nothing drains.
        let cfg = WriterConfig { threads: 1, memory_multiplier: 1, ..Default::default() };
        let (mut writer, handles) = build(cfg, 1, 6);
        for frame in [5, 4, 3, 2, 1] {
            writer.write(vec![frame as u8; 64], frame, Eyes::Both).unwrap();
        }
        // Give the consumer a moment to spill the backlog.
        std::thread::sleep(std::time::Duration::from_millis(50));
        writer.write(vec![0u8; 64], 0, Eyes::Both).unwrap();

        let finished = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(finished.stats.full_written, 6);
        assert!(finished.stats.spilled > 0, "expected tail spills under a 1-frame bound");

        let state = handles[0].lock().unwrap();
        let frames: Vec<i64> = state.frames.iter().map(|f| f.frame).collect();
        assert_eq!(frames, (0..6).collect::<Vec<_>>());
        // Rehydrated payloads are byte-identical
        for (i, f) in state.frames.iter().enumerate() {
            assert_eq!(state.picture_data[i * 64], f.frame as u8);
        }
    }

    #[test]
    fn test_repeat_and_fake() {
        let (mut writer, handles) = build(small_cfg(), 1, 4);
        writer.write(vec![1], 0, Eyes::Both).unwrap();
        writer.repeat(1, Eyes::Both).unwrap();
        writer.fake_write(2, Eyes::Both).unwrap();
        writer.write(vec![2], 3, Eyes::Both).unwrap();

        let finished = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(finished.stats.full_written, 2);
        assert_eq!(finished.stats.repeat_written, 1);
        assert_eq!(finished.stats.fake_written, 1);

        let state = handles[0].lock().unwrap();
        let kinds: Vec<WrittenKind> = state.frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![WrittenKind::Full, WrittenKind::Repeat, WrittenKind::Fake, WrittenKind::Full]);
    }

    #[test]
    fn test_fake_write_frame_zero_rejected() {
        let (mut writer, _) = build(small_cfg(), 2, 4);
        // Frame 0 of reel 0 and frame 4 == frame 0 of reel 1
        for global in [0, 4] {
            let err = writer.fake_write(global, Eyes::Both).unwrap_err();
            assert!(matches!(err, WriterError::ContractViolation(_)), "frame {}", global);
        }
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        let _ = writer.finish(tempfile::tempdir().unwrap().path());
    }

    #[test]
    fn test_fake_write_encrypted_rejected() {
        let cfg = WriterConfig { encrypted: true, ..small_cfg() };
        let (writer, _) = build(cfg, 1, 4);
        assert!(matches!(
            writer.fake_write(1, Eyes::Both),
            Err(WriterError::ContractViolation(_))
        ));
        writer.zombify();
    }

    #[test]
    fn test_repeat_frame_zero_rejected() {
        let (writer, _) = build(small_cfg(), 1, 4);
        assert!(!writer.can_repeat(0));
        assert!(writer.can_repeat(1));
        assert!(matches!(writer.repeat(0, Eyes::Both), Err(WriterError::ContractViolation(_))));
        writer.zombify();
    }

    #[test]
    #[should_panic(expected = "stereoscopic")]
    fn test_eyes_mismatch_is_fatal() {
        let cfg = WriterConfig { stereoscopic: true, ..small_cfg() };
        let (writer, _) = build(cfg, 1, 4);
        writer.zombify();
        let _ = writer.write(vec![0], 0, Eyes::Both);
    }

    #[test]
    fn test_stereo_pairs_drain_in_eye_order() {
        let cfg = WriterConfig { stereoscopic: true, ..small_cfg() };
        let (mut writer, handles) = build(cfg, 1, 3);
        // Right eyes first, then lefts, in reverse frame order
        for frame in [2, 1, 0] {
            writer.write(vec![frame as u8], frame, Eyes::Right).unwrap();
        }
        for frame in [2, 1, 0] {
            writer.write(vec![frame as u8], frame, Eyes::Left).unwrap();
        }
        let finished = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(finished.stats.full_written, 6);
        assert_eq!(finished.stats.leftover, 0);

        let state = handles[0].lock().unwrap();
        let order: Vec<(i64, Eyes)> = state.frames.iter().map(|f| (f.frame, f.eyes)).collect();
        assert_eq!(
            order,
            vec![
                (0, Eyes::Left),
                (0, Eyes::Right),
                (1, Eyes::Left),
                (1, Eyes::Right),
                (2, Eyes::Left),
                (2, Eyes::Right)
            ]
        );
    }

    #[test]
    fn test_gap_becomes_leftover_not_deadlock() {
        let (mut writer, handles) = build(small_cfg(), 1, 4);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        // Frame 1 never arrives; 2 and 3 must be discarded, not block finish.
        writer.write(vec![2], 2, Eyes::Both).unwrap();
        writer.write(vec![3], 3, Eyes::Both).unwrap();

        let finished = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(finished.stats.full_written, 1);
        assert_eq!(finished.stats.leftover, 2);
        assert_eq!(handles[0].lock().unwrap().frames.len(), 1);
    }

    #[test]
    fn test_zombify_makes_producers_noops() {
        let (mut writer, handles) = build(small_cfg(), 1, 4);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        writer.zombify();
        writer.write(vec![1], 1, Eyes::Both).unwrap();
        writer.repeat(1, Eyes::Both).unwrap();
        writer
            .write_audio(AudioBuffers::silent(2, 100), DcpTime::ZERO)
            .unwrap();
        assert!(matches!(writer.finish(tempfile::tempdir().unwrap().path()), Err(WriterError::Zombie)));
        // Nothing written after the zombie transition
        assert!(handles[0].lock().unwrap().frames.len() <= 1);
    }

    #[test]
    fn test_audio_routed_and_counted() {
        let (mut writer, handles) = build(small_cfg(), 2, 240);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        // 240 frames at 24 fps = 10 s per reel; 4 s of audio starting at 8 s
        // splits 2 s / 2 s across the reels.
        writer
            .write_audio(AudioBuffers::silent(6, 4 * 48_000), DcpTime::from_seconds(8.0))
            .unwrap();
        let _ = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();

        assert_eq!(handles[0].lock().unwrap().audio_frames, 2 * 48_000);
        assert_eq!(handles[1].lock().unwrap().audio_frames, 2 * 48_000);
    }

    #[test]
    fn test_atmos_advances_with_time() {
        let (mut writer, handles) = build(small_cfg(), 2, 240);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        let meta = AtmosMetadata { stream_id: uuid::Uuid::new_v4(), first_frame: 0, frame_rate: 24 };
        writer.write_atmos(AtmosFrame { data: vec![1] }, DcpTime::from_seconds(0.0), &meta).unwrap();
        writer.write_atmos(AtmosFrame { data: vec![2] }, DcpTime::from_seconds(10.0), &meta).unwrap();
        let _ = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();
        assert_eq!(handles[0].lock().unwrap().atmos_frames, 1);
        assert_eq!(handles[1].lock().unwrap().atmos_frames, 1);
    }

    #[test]
    fn test_text_deferred_across_boundary() {
        let (mut writer, handles) = build(small_cfg(), 2, 240);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        // Reel boundary at 10 s; span 8..12 s is truncated and deferred.
        writer
            .write_text(
                TextSpan::new("crossing"),
                TextType::OpenSubtitle,
                None,
                DcpTimePeriod::new(DcpTime::from_seconds(8.0), DcpTime::from_seconds(12.0)),
            )
            .unwrap();
        let _ = writer.finish(tempfile::tempdir().unwrap().path()).unwrap();

        let first = handles[0].lock().unwrap();
        let second = handles[1].lock().unwrap();
        assert_eq!(first.texts.len(), 1);
        assert_eq!(second.texts.len(), 1);
        // Truncated end: boundary minus two frame intervals
        assert_eq!(first.texts[0].period.to, DcpTime(10 * HZ - 2 * (HZ / 24)));
        assert_eq!(second.texts[0].period.from, DcpTime(10 * HZ));
    }

    #[test]
    fn test_invalid_signer_rejected_at_construction() {
        let mut identity = test_identity();
        identity.certificates.clear();
        let cfg = WriterConfig { signing: Some(identity), ..small_cfg() };
        let sink = MemoryReelSink::new(reel_periods(1, 4, 24)[0], false);
        let err = Writer::new(cfg, vec![Box::new(sink)], Arc::new(NullProgress)).unwrap_err();
        assert!(matches!(err, WriterError::InvalidSigner(_)));
    }

    #[test]
    fn test_signed_manifest_carries_thumbprint() {
        let cfg = WriterConfig { signing: Some(test_identity()), ..small_cfg() };
        let (mut writer, _) = build(cfg, 1, 2);
        writer.write(vec![0], 0, Eyes::Both).unwrap();
        writer.write(vec![1], 1, Eyes::Both).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let finished = writer.finish(dir.path()).unwrap();
        assert!(finished.manifest.signer_thumbprint.is_some());
        assert!(dir.path().join("manifest.json").exists());
        assert!(dir.path().join("SUMMARY.txt").exists());
    }

    #[test]
    fn test_non_contiguous_reels_rejected() {
        let sinks: Vec<Box<dyn ReelSink>> = vec![
            Box::new(MemoryReelSink::new(DcpTimePeriod::new(DcpTime(0), DcpTime(HZ)), false)),
            Box::new(MemoryReelSink::new(DcpTimePeriod::new(DcpTime(2 * HZ), DcpTime(3 * HZ)), false)),
        ];
        let err = Writer::new(WriterConfig::default(), sinks, Arc::new(NullProgress)).unwrap_err();
        assert!(matches!(err, WriterError::ContractViolation(_)));
    }
}
