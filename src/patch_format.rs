use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PatchError, Result};
use crate::fingerprint::{BlockHashes, Digest, DEFAULT_BLOCK_SIZE};

/// Archive entry holding the raw bytes of every `New` block.
pub const DATA_ENTRY: &str = "data";
/// Archive entry holding the JSON manifest.
pub const INFO_ENTRY: &str = "info";

/// Where the bytes of one reconstructed block come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Raw bytes stored in the patch data blob.
    New { data_offset: u64, data_size: u32 },
    /// Same bytes as the `New` block at `ref_offset` of the new file.
    Dedup { ref_offset: u64 },
    /// Same bytes as the block at `ref_offset` of the base file.
    FromBase { ref_offset: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchBlock {
    pub hash: Digest,
    pub source: BlockSource,
    /// How the `new` / `from_patch` flags were spelled in the manifest text.
    pub flags: BlockFlags,
}

/// Wire spelling of a block's booleans; `None` means the key was absent.
/// Re-encoding keeps a spelling as long as it still agrees with the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    pub new: Option<bool>,
    pub from_patch: Option<bool>,
}

impl BlockFlags {
    /// The spelling this crate writes for `source`.
    pub fn canonical(source: &BlockSource) -> Self {
        match source {
            BlockSource::New { .. } => Self {
                new: Some(true),
                from_patch: None,
            },
            BlockSource::Dedup { .. } => Self {
                new: Some(false),
                from_patch: Some(true),
            },
            BlockSource::FromBase { .. } => Self {
                new: Some(false),
                from_patch: Some(false),
            },
        }
    }
}

impl PatchBlock {
    pub fn new(hash: Digest, source: BlockSource) -> Self {
        Self {
            hash,
            source,
            flags: BlockFlags::canonical(&source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchManifest {
    pub blocksize: u32,
    /// Length of the new file.
    pub size: u64,
    /// Modification time of the new file, milliseconds since the Unix epoch.
    pub modified_time: u64,
    pub new_hash: Digest,
    /// Fingerprint of the base file; present only for differential patches.
    pub old_hash: Option<Digest>,
    pub blocks: BTreeMap<u64, PatchBlock>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchSummary {
    pub new_blocks: usize,
    pub dedup_blocks: usize,
    pub base_blocks: usize,
    pub data_bytes: u64,
}

impl PatchManifest {
    pub fn is_differential(&self) -> bool {
        self.old_hash.is_some()
    }

    /// The per-block hashes the reconstructed file must reproduce.
    pub fn block_hashes(&self) -> BlockHashes {
        self.blocks
            .iter()
            .map(|(&offset, block)| (offset, block.hash))
            .collect()
    }

    /// Length of the new-file block starting at `offset`.
    pub fn block_len(&self, offset: u64) -> u64 {
        self.size.saturating_sub(offset).min(self.blocksize as u64)
    }

    pub fn summary(&self) -> PatchSummary {
        let mut summary = PatchSummary::default();
        for block in self.blocks.values() {
            match block.source {
                BlockSource::New { data_size, .. } => {
                    summary.new_blocks += 1;
                    summary.data_bytes += data_size as u64;
                }
                BlockSource::Dedup { .. } => summary.dedup_blocks += 1,
                BlockSource::FromBase { .. } => summary.base_blocks += 1,
            }
        }
        summary
    }

    /// Check that every reference inside the manifest resolves against a
    /// data blob of `data_len` bytes.
    pub fn validate(&self, data_len: u64) -> Result<()> {
        if self.blocksize == 0 {
            return Err(PatchError::corrupt("blocksize is zero"));
        }
        for (offset, block) in &self.blocks {
            match block.source {
                BlockSource::New {
                    data_offset,
                    data_size,
                } => {
                    let end = data_offset.checked_add(data_size as u64);
                    if end.map_or(true, |end| end > data_len) {
                        return Err(PatchError::corrupt(format!(
                            "block {offset} reads {data_size} bytes at {data_offset}, past the {data_len}-byte data blob"
                        )));
                    }
                }
                BlockSource::Dedup { ref_offset } => match self.blocks.get(&ref_offset) {
                    Some(PatchBlock {
                        source: BlockSource::New { .. },
                        ..
                    }) => {}
                    Some(_) => {
                        return Err(PatchError::corrupt(format!(
                            "block {offset} dedups against block {ref_offset}, which is not a raw block"
                        )))
                    }
                    None => {
                        return Err(PatchError::corrupt(format!(
                            "block {offset} dedups against missing block {ref_offset}"
                        )))
                    }
                },
                BlockSource::FromBase { .. } => {}
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&ManifestRecord::from(self))
            .map_err(|e| PatchError::corrupt(format!("cannot encode manifest: {e}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let record: ManifestRecord = serde_json::from_slice(bytes)
            .map_err(|e| PatchError::corrupt(format!("cannot decode manifest: {e}")))?;
        record.try_into()
    }
}

// Wire shape of the manifest. Field names and the string-keyed block map are
// the compatibility surface shared with other producers of these artifacts.

#[derive(Debug, Serialize, Deserialize)]
struct ManifestRecord {
    blocks: BTreeMap<u64, BlockRecord>,
    new_hash: Digest,
    #[serde(default = "default_blocksize", deserialize_with = "whole_u32")]
    blocksize: u32,
    #[serde(deserialize_with = "whole_u64")]
    size: u64,
    #[serde(deserialize_with = "whole_u64")]
    time_modify: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    old_hash: Option<Digest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    hash: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from_patch: Option<bool>,
    #[serde(deserialize_with = "whole_u64")]
    offset: u64,
    #[serde(
        default,
        deserialize_with = "some_whole_u32",
        skip_serializing_if = "Option::is_none"
    )]
    data_size: Option<u32>,
}

fn default_blocksize() -> u32 {
    DEFAULT_BLOCK_SIZE
}

impl From<&PatchManifest> for ManifestRecord {
    fn from(manifest: &PatchManifest) -> Self {
        let blocks = manifest
            .blocks
            .iter()
            .map(|(&offset, block)| (offset, BlockRecord::from(block)))
            .collect();
        Self {
            blocks,
            new_hash: manifest.new_hash,
            blocksize: manifest.blocksize,
            size: manifest.size,
            time_modify: manifest.modified_time,
            old_hash: manifest.old_hash,
        }
    }
}

/// Keep the recorded spelling of a flag when it still means `implied`.
fn spell(recorded: Option<bool>, implied: bool) -> Option<bool> {
    match recorded {
        Some(v) if v == implied => Some(v),
        None if !implied => None,
        _ => Some(implied),
    }
}

impl From<&PatchBlock> for BlockRecord {
    fn from(block: &PatchBlock) -> Self {
        let (is_new, is_dedup, offset, data_size) = match block.source {
            BlockSource::New {
                data_offset,
                data_size,
            } => (true, false, data_offset, Some(data_size)),
            BlockSource::Dedup { ref_offset } => (false, true, ref_offset, None),
            BlockSource::FromBase { ref_offset } => (false, false, ref_offset, None),
        };
        Self {
            hash: block.hash,
            new: spell(block.flags.new, is_new),
            from_patch: spell(block.flags.from_patch, is_dedup),
            offset,
            data_size,
        }
    }
}

impl TryFrom<ManifestRecord> for PatchManifest {
    type Error = PatchError;

    fn try_from(record: ManifestRecord) -> Result<Self> {
        let blocks = record
            .blocks
            .into_iter()
            .map(|(offset, block)| Ok((offset, block.into_block(offset)?)))
            .collect::<Result<_>>()?;
        Ok(Self {
            blocksize: record.blocksize,
            size: record.size,
            modified_time: record.time_modify,
            new_hash: record.new_hash,
            old_hash: record.old_hash,
            blocks,
        })
    }
}

impl BlockRecord {
    fn into_block(self, at: u64) -> Result<PatchBlock> {
        let source = match (self.new.unwrap_or(false), self.from_patch.unwrap_or(false)) {
            (true, true) => {
                return Err(PatchError::corrupt(format!(
                    "block {at} is marked both new and from_patch"
                )))
            }
            (true, false) => BlockSource::New {
                data_offset: self.offset,
                data_size: self.data_size.ok_or_else(|| {
                    PatchError::corrupt(format!("raw block {at} has no data_size"))
                })?,
            },
            (false, _) if self.data_size.is_some() => {
                return Err(PatchError::corrupt(format!(
                    "block {at} carries data_size but is not a raw block"
                )))
            }
            (false, true) => BlockSource::Dedup {
                ref_offset: self.offset,
            },
            (false, false) => BlockSource::FromBase {
                ref_offset: self.offset,
            },
        };
        Ok(PatchBlock {
            hash: self.hash,
            source,
            flags: BlockFlags {
                new: self.new,
                from_patch: self.from_patch,
            },
        })
    }
}

/// Accepts integers and floats with no fractional part, as written by
/// producers that keep every JSON number as a double.
struct WholeNumber;

impl<'de> Visitor<'de> for WholeNumber {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative whole number")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<u64, E> {
        u64::try_from(v).map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<u64, E> {
        // 2^64 is exactly representable; everything below it with no fraction fits.
        if v >= 0.0 && v < 18_446_744_073_709_551_616.0 && v.fract() == 0.0 {
            Ok(v as u64)
        } else {
            Err(E::invalid_value(Unexpected::Float(v), &self))
        }
    }
}

fn whole_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    deserializer.deserialize_any(WholeNumber)
}

fn whole_u32<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let v = whole_u64(deserializer)?;
    u32::try_from(v).map_err(|_| de::Error::invalid_value(Unexpected::Unsigned(v), &"a 32-bit value"))
}

fn some_whole_u32<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u32>, D::Error> {
    whole_u32(deserializer).map(Some)
}
