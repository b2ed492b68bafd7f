//! Writer error taxonomy.

/// Errors surfaced by the writer and its collaborators.
#[derive(Debug)]
pub enum WriterError {
    /// Caller broke an API precondition (fake-write of frame 0, fake-write on
    /// an encrypted output, repeat with nothing to repeat, data outside every
    /// reel period). Indicates a bug in the encoder driving us.
    ContractViolation(String),
    /// The configured signing identity cannot possibly sign the package.
    /// Checked at construction and again before any manifest is written.
    InvalidSigner(String),
    /// Spill/rehydrate or sink I/O failure. Fatal to the job; a frame is
    /// never silently dropped because a temp write failed.
    Io(std::io::Error),
    /// Cooperative cancellation during the digest pass. Not a failure of the
    /// written output; the caller decides what to do with the half-hashed job.
    Cancelled,
    /// The writer was torn down (`zombify`) before this call completed.
    Zombie,
    /// A per-reel sink reported a problem of its own.
    Sink(String),
}

impl std::fmt::Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterError::ContractViolation(msg) => write!(f, "contract violation: {}", msg),
            WriterError::InvalidSigner(msg) => write!(f, "invalid signing identity: {}", msg),
            WriterError::Io(e) => write!(f, "I/O error: {}", e),
            WriterError::Cancelled => write!(f, "cancelled"),
            WriterError::Zombie => write!(f, "writer already shut down"),
            WriterError::Sink(msg) => write!(f, "reel sink error: {}", msg),
        }
    }
}

impl std::error::Error for WriterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WriterError {
    fn from(e: std::io::Error) -> Self {
        WriterError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, WriterError>;
