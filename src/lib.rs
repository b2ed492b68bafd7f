//! REELPACK - Multi-reel cinema package writer library
//!
//! Re-exports the writer and its collaborator types.

// Core pipeline (queue, spill, writer, digest)
pub mod digest;
pub mod queue;
pub mod spill;
pub mod writer;

// Routing and collaborators
pub mod audio;
pub mod config;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod sink;
pub mod text;
pub mod time;
pub mod types;

// Re-export commonly used types
pub use config::WriterConfig;
pub use error::{Result, WriterError};
pub use manifest::{PackageManifest, PackageMetadata, ReferencedAsset, ReelDigests, SigningIdentity};
pub use progress::{ChannelProgress, NullProgress, Progress, ProgressEvent};
pub use sink::{MemoryReelSink, ReelSink};
pub use time::{DcpTime, DcpTimePeriod, HZ};
pub use types::{AtmosFrame, AtmosMetadata, AudioBuffers, Eyes, Font, FontSet, TextSpan, TextType};
pub use writer::{FinishedPackage, Writer, WriterStats};
