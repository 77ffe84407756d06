use std::io;
use std::path::PathBuf;

use crate::fingerprint::{BlockHashes, Digest};

/// Errors returned by fingerprinting, patch creation and patch application.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Open, read, write or rename failure on a file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid block size: {0} (must be greater than zero)")]
    InvalidBlockSize(u32),

    /// The artifact is missing an entry, holds a malformed manifest, or the
    /// manifest describes blocks that cannot exist.
    #[error("Corrupt patch manifest: {0}")]
    ManifestCorrupt(String),

    /// A differential patch was applied against a base other than the one it was built for.
    #[error("Patch was built for base {recorded}, but current file is {}", display_expected(.expected))]
    WrongBaseFile {
        expected: Option<Digest>,
        recorded: Digest,
    },

    #[error("Patch needs blocks from the base file, but {path} could not be opened")]
    MissingBaseFile { path: PathBuf },

    /// The reconstructed bytes do not hash to what the manifest recorded.
    #[error(
        "Patch result failed verification: expected {} blocks {:?}, got {} blocks {:?}",
        .expected.len(), .expected, .actual.len(), .actual
    )]
    IntegrityVerificationFailed {
        expected: BlockHashes,
        actual: BlockHashes,
    },

    #[error("Corrupt signature file: {0}")]
    SignatureCorrupt(String),
}

fn display_expected(expected: &Option<Digest>) -> String {
    match expected {
        Some(digest) => digest.to_string(),
        None => "unknown".to_string(),
    }
}

impl PatchError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::ManifestCorrupt(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Attaches the offending path to `io::Result` values.
pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| PatchError::io(path, e))
    }
}
