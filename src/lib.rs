//! Fixed-block, content-addressed file patching.
//!
//! A file is split into fixed-size blocks identified by their MD5 digest.
//! [`create::create_patch`] turns a new file, and optionally the block hashes
//! of a base file, into a patch artifact in which every block is raw bytes, a
//! dedup of an earlier block of the same file, or a reference into the base.
//! [`apply::apply_patch`] rebuilds the file from the artifact, verifies it
//! block by block, and returns the fingerprints that serve as the base of the
//! next patch in a chain.

pub mod apply;
pub mod container;
pub mod create;
pub mod error;
pub mod fingerprint;
pub mod patch_format;
pub mod signature;
mod util;

pub use apply::{apply_patch, AppliedPatch, ApplyOptions};
pub use create::{create_patch, BuildOptions, KnownFingerprints};
pub use error::{PatchError, Result};
pub use fingerprint::{
    file_fingerprint, fingerprint_bytes, fingerprint_file, BlockHashes, Digest,
    DEFAULT_BLOCK_SIZE,
};
pub use patch_format::{BlockFlags, BlockSource, PatchBlock, PatchManifest, PatchSummary};
pub use util::MappedFile;
