//! Signature files: a file's block hashes and fingerprint kept on disk so the
//! next patch in a chain can be built without rereading the base file.
//!
//! Layout: `MAGIC`, then a zstd-compressed bincode [`Signature`].

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

use crate::error::{IoResultExt, PatchError, Result};
use crate::fingerprint::{self, file_fingerprint, BlockHashes, Digest};
use crate::util;

pub const MAGIC: &[u8; 8] = b"BPSIGV01";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub version: u32,
    pub blocksize: u32,
    pub file_hash: Digest,
    pub blocks: BlockHashes,
}

impl Signature {
    pub fn new(blocksize: u32, blocks: BlockHashes) -> Self {
        Self {
            version: FORMAT_VERSION,
            blocksize,
            file_hash: file_fingerprint(&blocks),
            blocks,
        }
    }

    pub fn of_file(path: &Path, blocksize: u32) -> Result<Self> {
        Ok(Self::new(
            blocksize,
            fingerprint::fingerprint_file(path, blocksize)?,
        ))
    }
}

pub fn write_signature(path: &Path, signature: &Signature) -> Result<()> {
    let encoded = bincode::serialize(signature)
        .map_err(|e| PatchError::SignatureCorrupt(format!("cannot encode signature: {e}")))?;
    let compressed = zstd::bulk::compress(&encoded, 3).with_path(path)?;

    let staged = util::staging_file(path)?;
    let mut file = staged.as_file();
    file.write_all(MAGIC).with_path(path)?;
    file.write_all(&compressed).with_path(path)?;
    file.flush().with_path(path)?;
    util::commit_staged(staged, path)
}

pub fn read_signature(path: &Path) -> Result<Signature> {
    let raw = util::mmap_path(path)?;

    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(PatchError::SignatureCorrupt(format!(
            "{}: missing magic header",
            path.display()
        )));
    }

    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..]).with_path(path)?;
    let signature: Signature = bincode::deserialize_from(decoder).map_err(|e| {
        PatchError::SignatureCorrupt(format!("{}: {e}", path.display()))
    })?;

    if signature.version != FORMAT_VERSION {
        return Err(PatchError::SignatureCorrupt(format!(
            "unsupported signature version: {} (expected {})",
            signature.version, FORMAT_VERSION
        )));
    }
    if file_fingerprint(&signature.blocks) != signature.file_hash {
        return Err(PatchError::SignatureCorrupt(format!(
            "{}: file hash does not match block hashes",
            path.display()
        )));
    }

    Ok(signature)
}
