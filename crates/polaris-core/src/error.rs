//! Process-level (control-plane) error type for `polaris-core`.
//!
//! Distinct from [`crate::model::MalformedRecord`], which is the
//! data-plane's own error channel and never surfaces here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Write-side fatal error: permission denied or the output directory
    /// went away. Per spec §7 this is not retried -- the process exits 3.
    #[error("fatal write error: {0}")]
    WriteFatal(String),

    /// IO error that isn't on the write fast path (e.g. startup recovery
    /// scan of the output directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// `true` when the process should exit 3 (fatal I/O) rather than 1
    /// (unexpected crash), per spec §6 exit code table.
    #[must_use]
    pub fn is_fatal_io(&self) -> bool {
        matches!(self, Self::WriteFatal(_) | Self::Io(_))
    }
}
