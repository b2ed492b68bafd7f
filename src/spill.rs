//! Temp-file overflow store for frame payloads under memory pressure.
//!
//! Files are keyed by `(reel, frame, eyes)` and deleted on recovery. Orphans
//! left by a crash are not swept here; that belongs to an external cleanup.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use tempfile::TempDir;

use crate::types::Eyes;

#[derive(Debug)]
pub struct SpillStore {
    dir: PathBuf,
    // Held so the directory is removed when the store goes away.
    _tmp: Option<TempDir>,
}

impl SpillStore {
    /// Store rooted in a fresh temporary directory.
    pub fn new() -> std::io::Result<Self> {
        let tmp = tempfile::Builder::new().prefix("reelpack-spill-").tempdir()?;
        debug!("spill store at {}", tmp.path().display());
        Ok(SpillStore { dir: tmp.path().to_path_buf(), _tmp: Some(tmp) })
    }

    /// Store rooted in a caller-supplied directory (created if missing).
    /// The directory is not removed on drop.
    pub fn with_dir(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        debug!("spill store at {}", dir.display());
        Ok(SpillStore { dir: dir.to_path_buf(), _tmp: None })
    }

    fn path_for(&self, reel: usize, frame: i64, eyes: Eyes) -> PathBuf {
        self.dir.join(format!("r{:03}-f{:08}-{}.bin", reel, frame, eyes.tag()))
    }

    /// Write a payload out. A failure here is fatal to the job; the caller
    /// must not drop the frame and continue.
    pub fn store(&self, reel: usize, frame: i64, eyes: Eyes, payload: &[u8]) -> std::io::Result<()> {
        let path = self.path_for(reel, frame, eyes);
        trace!("spill reel {} frame {} {} ({} bytes)", reel, frame, eyes, payload.len());
        fs::write(path, payload)
    }

    /// Read a payload back and delete its temp file.
    pub fn recover(&self, reel: usize, frame: i64, eyes: Eyes) -> std::io::Result<Vec<u8>> {
        let path = self.path_for(reel, frame, eyes);
        let bytes = fs::read(&path)?;
        fs::remove_file(&path)?;
        trace!("rehydrated reel {} frame {} {} ({} bytes)", reel, frame, eyes, bytes.len());
        Ok(bytes)
    }

    /// True if a spilled payload exists for this key.
    pub fn contains(&self, reel: usize, frame: i64, eyes: Eyes) -> bool {
        self.path_for(reel, frame, eyes).exists()
    }
}
