//! Block fingerprints: per-block MD5 digests of a file and the whole-file
//! identity derived from them.
//!
//! A file is cut into `blocksize` blocks starting at offset 0; every block but
//! the last is full. The file fingerprint is the MD5 of the concatenated hex
//! strings of the block digests, so two parties can compare versions by
//! exchanging 32 characters, and a caller holding cached block hashes never
//! has to reread the file.

use md5::{Digest as _, Md5};
use rayon::prelude::*;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use crate::error::{IoResultExt, PatchError, Result};

/// Block size used when the caller does not pick one (1 MiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

/// Ordered `offset -> digest` map covering a file contiguously.
pub type BlockHashes = BTreeMap<u64, Digest>;

/// 128-bit content digest, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self::from_md5(hasher)
    }

    fn from_md5(hasher: Md5) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest {0:?}: expected 32 lowercase hex characters")]
pub struct ParseDigestError(String);

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || ParseDigestError(s.to_string());
        if s.len() != 32 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid());
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

pub(crate) fn check_blocksize(blocksize: u32) -> Result<()> {
    if blocksize == 0 {
        return Err(PatchError::InvalidBlockSize(blocksize));
    }
    Ok(())
}

/// Fill `buf` from `reader` until it is full or the reader hits end of file.
/// Returns the number of bytes filled; anything short of `buf.len()` means EOF.
pub(crate) fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hash every block read from `reader`, sequentially, reusing one buffer.
pub fn fingerprint_reader<R: Read>(mut reader: R, blocksize: u32) -> io::Result<BlockHashes> {
    let mut hashes = BlockHashes::new();
    let mut buffer = vec![0u8; blocksize as usize];
    let mut offset = 0u64;

    loop {
        let filled = fill_block(&mut reader, &mut buffer)?;
        if filled == 0 {
            break;
        }
        hashes.insert(offset, Digest::of(&buffer[..filled]));
        offset += filled as u64;
        if filled < buffer.len() {
            break;
        }
    }

    Ok(hashes)
}

/// Compute the block hashes of the file at `path`.
pub fn fingerprint_file(path: &Path, blocksize: u32) -> Result<BlockHashes> {
    check_blocksize(blocksize)?;
    let file = File::open(path).with_path(path)?;
    fingerprint_reader(file, blocksize).with_path(path)
}

/// Compute block hashes over bytes already in memory, hashing blocks in parallel.
/// Yields exactly what [`fingerprint_file`] yields for the same content.
pub fn fingerprint_bytes(data: &[u8], blocksize: u32) -> Result<BlockHashes> {
    check_blocksize(blocksize)?;
    let step = blocksize as u64;
    Ok(data
        .par_chunks(blocksize as usize)
        .enumerate()
        .map(|(i, block)| (i as u64 * step, Digest::of(block)))
        .collect())
}

/// Fold block hashes, in offset order, into one whole-file fingerprint.
pub fn file_fingerprint(hashes: &BlockHashes) -> Digest {
    let mut hasher = Md5::new();
    for digest in hashes.values() {
        hasher.update(digest.to_hex().as_bytes());
    }
    Digest::from_md5(hasher)
}
