//! Post-encode digest pass: a fixed-size thread pool hashes every reel and
//! every referenced asset, folding per-task byte progress into one fraction.
//!
//! The pool runs only after the write queue has fully stopped, so each sink
//! is touched by exactly one pool thread.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::deque::{Injector, Steal};
use log::{debug, trace, warn};
use sha2::{Digest, Sha256};

use crate::error::{Result, WriterError};
use crate::manifest::{ReelDigests, ReferencedAsset};
use crate::progress::Progress;
use crate::sink::ReelSink;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool for digest tasks.
///
/// Tasks are long (one whole reel each), so a single injector with polling
/// workers is enough; there is no stealing hierarchy to balance.
pub struct DigestPool {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl DigestPool {
    pub fn new(num_threads: usize) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for worker_id in 0..num_threads.max(1) {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("reelpack-digest-{}", worker_id))
                .spawn(move || {
                    trace!("digest worker {} started", worker_id);
                    loop {
                        match injector.steal() {
                            Steal::Success(job) => job(),
                            Steal::Retry => continue,
                            Steal::Empty => {
                                if shutdown.load(Ordering::Relaxed) {
                                    break;
                                }
                                thread::sleep(std::time::Duration::from_millis(1));
                            }
                        }
                    }
                    trace!("digest worker {} stopped", worker_id);
                })
                .expect("failed to spawn digest worker");
            handles.push(handle);
        }

        DigestPool { injector, handles, shutdown }
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }
}

impl Drop for DigestPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("digest worker panicked during shutdown");
            }
        }
    }
}

/// Hash a byte slice in 1 MiB chunks, reporting fraction done and polling the
/// cancel flag between chunks.
pub fn hash_bytes_chunked(data: &[u8], report: &dyn Fn(f32), cancel: &AtomicBool) -> Result<String> {
    const CHUNK: usize = 1 << 20;
    let total = data.len().max(1);
    let mut hasher = Sha256::new();
    let mut done = 0usize;
    for chunk in data.chunks(CHUNK) {
        if cancel.load(Ordering::Relaxed) {
            return Err(WriterError::Cancelled);
        }
        hasher.update(chunk);
        done += chunk.len();
        report(done as f32 / total as f32);
    }
    report(1.0);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file the same way, streaming rather than loading it whole.
pub fn hash_file(path: &Path, report: &dyn Fn(f32), cancel: &AtomicBool) -> Result<String> {
    const CHUNK: usize = 1 << 20;
    let mut file = File::open(path)?;
    let total = file.metadata()?.len().max(1);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut done = 0u64;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(WriterError::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        done += n as u64;
        report(done as f32 / total as f32);
    }
    report(1.0);
    Ok(hex::encode(hasher.finalize()))
}

enum TaskResult {
    Reel(usize, Result<ReelDigests>),
    Asset(usize, Result<String>),
}

/// Run the whole digest pass: one task per reel, one per referenced asset.
///
/// Referenced assets get their `digest` field filled in place. Cancellation
/// aborts in-flight hashing and skips queued tasks; already-written output is
/// untouched either way.
pub fn run_digest_pass(
    threads: usize,
    sinks: &[Arc<Mutex<Box<dyn ReelSink>>>],
    referenced: &mut [ReferencedAsset],
    progress: &Arc<dyn Progress>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<ReelDigests>> {
    let task_count = sinks.len() + referenced.len();
    if task_count == 0 {
        return Ok(Vec::new());
    }
    debug!("digest pass: {} reels, {} referenced assets, {} threads", sinks.len(), referenced.len(), threads);

    let pool = DigestPool::new(threads);
    let fractions = Arc::new(Mutex::new(vec![0.0f32; task_count]));
    let (tx, rx) = mpsc::channel::<TaskResult>();

    // Fold one task's fraction into the aggregate.
    let make_reporter = |slot: usize| {
        let fractions = Arc::clone(&fractions);
        let progress = Arc::clone(progress);
        move |f: f32| {
            let mut fr = fractions.lock().unwrap();
            fr[slot] = f;
            let total: f32 = fr.iter().sum::<f32>() / fr.len() as f32;
            progress.set_progress(total);
        }
    };

    for (i, sink) in sinks.iter().enumerate() {
        let sink = Arc::clone(sink);
        let cancel = Arc::clone(&cancel);
        let tx = tx.clone();
        let report = make_reporter(i);
        pool.execute(move || {
            let result = if cancel.load(Ordering::Relaxed) {
                Err(WriterError::Cancelled)
            } else {
                sink.lock().unwrap().calculate_digests(&report, &cancel)
            };
            let _ = tx.send(TaskResult::Reel(i, result));
        });
    }

    for (j, asset) in referenced.iter().enumerate() {
        let path = asset.path.clone();
        let cancel = Arc::clone(&cancel);
        let tx = tx.clone();
        let report = make_reporter(sinks.len() + j);
        pool.execute(move || {
            let result = if cancel.load(Ordering::Relaxed) {
                Err(WriterError::Cancelled)
            } else {
                hash_file(&path, &report, &cancel)
            };
            let _ = tx.send(TaskResult::Asset(j, result));
        });
    }
    drop(tx);

    let mut reel_digests: Vec<Option<ReelDigests>> = vec![None; sinks.len()];
    let mut first_error: Option<WriterError> = None;
    let mut cancelled = false;
    for _ in 0..task_count {
        match rx.recv().expect("digest pool dropped its channel") {
            TaskResult::Reel(i, Ok(d)) => reel_digests[i] = Some(d),
            TaskResult::Asset(j, Ok(digest)) => referenced[j].digest = Some(digest),
            TaskResult::Reel(_, Err(WriterError::Cancelled))
            | TaskResult::Asset(_, Err(WriterError::Cancelled)) => cancelled = true,
            TaskResult::Reel(i, Err(e)) => {
                warn!("digest of reel {} failed: {}", i, e);
                first_error.get_or_insert(e);
            }
            TaskResult::Asset(j, Err(e)) => {
                warn!("digest of referenced asset {} failed: {}", referenced[j].path.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if cancelled {
        return Err(WriterError::Cancelled);
    }
    Ok(reel_digests.into_iter().map(|d| d.expect("reel digest missing")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ChannelProgress, ProgressEvent};
    use crate::sink::MemoryReelSink;
    use crate::time::{DcpTime, DcpTimePeriod};
    use crate::types::Eyes;

    fn boxed_sink_with_frame() -> Arc<Mutex<Box<dyn ReelSink>>> {
        let mut sink = MemoryReelSink::new(
            DcpTimePeriod::new(DcpTime::ZERO, DcpTime::from_frames(24, 24)),
            false,
        );
        sink.write_frame(&[7u8; 4096], 0, Eyes::Both).unwrap();
        Arc::new(Mutex::new(Box::new(sink) as Box<dyn ReelSink>))
    }

    #[test]
    fn test_hash_bytes_known_value() {
        let cancel = AtomicBool::new(false);
        let digest = hash_bytes_chunked(b"abc", &|_| {}, &cancel).unwrap();
        assert_eq!(digest, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn test_hash_cancel_aborts() {
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            hash_bytes_chunked(&[0u8; 16], &|_| {}, &cancel),
            Err(WriterError::Cancelled)
        ));
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");
        std::fs::write(&path, b"abc").unwrap();
        let cancel = AtomicBool::new(false);
        let from_file = hash_file(&path, &|_| {}, &cancel).unwrap();
        let from_bytes = hash_bytes_chunked(b"abc", &|_| {}, &cancel).unwrap();
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn test_run_digest_pass_fills_everything() {
        let sinks = vec![boxed_sink_with_frame(), boxed_sink_with_frame()];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.mxf");
        std::fs::write(&path, vec![1u8; 8192]).unwrap();
        let mut referenced = vec![ReferencedAsset { id: uuid::Uuid::new_v4(), path, digest: None }];

        let (progress, rx) = ChannelProgress::new();
        let progress: Arc<dyn Progress> = Arc::new(progress);
        let digests = run_digest_pass(2, &sinks, &mut referenced, &progress, Arc::new(AtomicBool::new(false))).unwrap();

        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0], digests[1]);
        assert!(referenced[0].digest.is_some());

        // Aggregate progress ends at 1.0 and never exceeds it
        let mut last = 0.0f32;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Fraction(f) = event {
                assert!(f <= 1.0 + f32::EPSILON);
                last = f;
            }
        }
        assert!((last - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_run_digest_pass_cancelled() {
        let sinks = vec![boxed_sink_with_frame()];
        let progress: Arc<dyn Progress> = Arc::new(crate::progress::NullProgress);
        let cancel = Arc::new(AtomicBool::new(true));
        let err = run_digest_pass(1, &sinks, &mut [], &progress, cancel).unwrap_err();
        assert!(matches!(err, WriterError::Cancelled));
    }
}
