//! Writer configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::manifest::SigningIdentity;

/// Everything the writer needs to know up front. Serde-derived so jobs can be
/// persisted and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Encoding worker count; also sizes the digest thread pool.
    pub threads: usize,
    /// In-memory FULL-frame cap is `threads * memory_multiplier`.
    pub memory_multiplier: usize,
    /// Overall queue-length cap for repeat/fake backpressure.
    /// `None` derives `memory cap * 4`.
    pub max_queue_len: Option<usize>,
    /// Video frames per second (DCP rates are integral).
    pub frame_rate: u32,
    /// Audio samples per second.
    pub audio_sample_rate: u32,
    /// Stereoscopic output: frames arrive tagged Left/Right, never Both.
    pub stereoscopic: bool,
    /// Encrypted output: frame identity is folded into integrity codes, so
    /// placeholder frames can never be swapped for real ones later.
    pub encrypted: bool,
    /// Interop-style target that only allows one embedded font declaration.
    pub interop: bool,
    pub content_title: String,
    /// Required for signed packages; validated at construction and at finish.
    pub signing: Option<SigningIdentity>,
    /// Spill directory for overflow frames. `None` uses a fresh temp dir.
    pub spill_dir: Option<PathBuf>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            threads: num_cpus::get(),
            memory_multiplier: 3,
            max_queue_len: None,
            frame_rate: 24,
            audio_sample_rate: 48_000,
            stereoscopic: false,
            encrypted: false,
            interop: false,
            content_title: "Untitled".to_string(),
            signing: None,
            spill_dir: None,
        }
    }
}

impl WriterConfig {
    /// Maximum FULL payloads resident in memory before producers block and
    /// the consumer starts spilling from the queue tail.
    pub fn max_full_in_memory(&self) -> usize {
        (self.threads * self.memory_multiplier).max(1)
    }

    /// Queue-length cap applied to `repeat`/`fake_write`.
    pub fn max_queue_len(&self) -> usize {
        self.max_queue_len.unwrap_or(self.max_full_in_memory() * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_limits() {
        let cfg = WriterConfig { threads: 4, memory_multiplier: 3, ..Default::default() };
        assert_eq!(cfg.max_full_in_memory(), 12);
        assert_eq!(cfg.max_queue_len(), 48);

        let explicit = WriterConfig { max_queue_len: Some(7), ..cfg };
        assert_eq!(explicit.max_queue_len(), 7);
    }

    #[test]
    fn test_memory_cap_never_zero() {
        let cfg = WriterConfig { threads: 1, memory_multiplier: 0, ..Default::default() };
        assert_eq!(cfg.max_full_in_memory(), 1);
    }
}
