//! Job-progress collaborator.
//!
//! The writer reports a 0..1 fraction plus a free-text stage name during both
//! the encode drain and the digest pass. Reporting can never fail; a caller
//! that does not care plugs in [`NullProgress`].

use std::sync::Mutex;
use std::sync::mpsc;

/// Receives progress from the writer. Implementations must be cheap: the
/// consumer thread calls `set_progress` once per committed frame.
pub trait Progress: Send + Sync {
    /// Overall fraction in 0..=1 for the current stage.
    fn set_progress(&self, fraction: f32);

    /// Named sub-stage ("Encoding image data", "Computing digests", ...).
    fn sub(&self, name: &str);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn set_progress(&self, _fraction: f32) {}
    fn sub(&self, _name: &str) {}
}

/// Progress event forwarded by [`ChannelProgress`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Fraction(f32),
    Stage(String),
}

/// Forwards events over an mpsc channel; handy for tests and UIs that poll.
/// Send failures are swallowed: a vanished receiver must not kill the job.
#[derive(Debug)]
pub struct ChannelProgress {
    tx: Mutex<mpsc::Sender<ProgressEvent>>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (ChannelProgress { tx: Mutex::new(tx) }, rx)
    }
}

impl Progress for ChannelProgress {
    fn set_progress(&self, fraction: f32) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(ProgressEvent::Fraction(fraction));
        }
    }

    fn sub(&self, name: &str) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(ProgressEvent::Stage(name.to_string()));
        }
    }
}
