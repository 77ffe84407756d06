use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::container::{self, PatchArtifact};
use crate::error::{IoResultExt, PatchError, Result};
use crate::fingerprint::{self, BlockHashes, Digest};
use crate::patch_format::{BlockSource, PatchManifest, PatchSummary};
use crate::util::{self, MappedFile};

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Where the unpacked data blob goes. Defaults to the directory of the
    /// output file.
    pub scratch_dir: Option<PathBuf>,
}

/// Identity of the file a patch produced, ready to serve as the base of the next patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    pub new_hash: Digest,
    pub block_hashes: BlockHashes,
    pub blocksize: u32,
    pub summary: PatchSummary,
}

/// Reconstruct the patch target from `patch_path` and, for blocks that need
/// it, the base file at `current`, then replace `output` with the result.
///
/// A differential patch is only applied when `expected_base` equals the base
/// identity it was built against. The rebuilt file is re-fingerprinted and
/// must match the manifest block for block before it becomes visible at
/// `output`.
pub fn apply_patch(
    current: &Path,
    output: &Path,
    patch_path: &Path,
    expected_base: Option<Digest>,
    options: &ApplyOptions,
) -> Result<AppliedPatch> {
    let scratch_dir = util::scratch_dir_for(options.scratch_dir.as_deref(), output);
    let PatchArtifact { manifest, data } = container::read_artifact(patch_path, &scratch_dir)?;

    if let Some(recorded) = manifest.old_hash {
        if expected_base != Some(recorded) {
            warn!(
                patch = %patch_path.display(),
                %recorded,
                "patch was built for a different base file"
            );
            return Err(PatchError::WrongBaseFile {
                expected: expected_base,
                recorded,
            });
        }
    }

    let base = open_base(current);
    let staged = util::staging_file(output)?;
    reconstruct(&manifest, &data, base.as_ref(), current, staged.as_file(), staged.path())?;
    drop(base);
    drop(data);

    let expected = manifest.block_hashes();
    let actual = fingerprint::fingerprint_file(staged.path(), manifest.blocksize)?;
    if actual != expected {
        warn!(
            patch = %patch_path.display(),
            expected_blocks = expected.len(),
            actual_blocks = actual.len(),
            "patch result failed verification"
        );
        return Err(PatchError::IntegrityVerificationFailed { expected, actual });
    }

    util::commit_staged(staged, output)?;

    let summary = manifest.summary();
    info!(
        output = %output.display(),
        new_hash = %manifest.new_hash,
        blocks = actual.len(),
        "patch applied"
    );
    Ok(AppliedPatch {
        new_hash: manifest.new_hash,
        block_hashes: actual,
        blocksize: manifest.blocksize,
        summary,
    })
}

/// Map the base file if it can be opened and mapped. Not having one is only
/// an error once a block actually needs it.
fn open_base(current: &Path) -> Option<MappedFile> {
    match util::mmap_path(current) {
        Ok(base) => Some(base),
        Err(e) => {
            debug!(base = %current.display(), error = %e, "no base file available");
            None
        }
    }
}

fn blob_range<'a>(data: &'a [u8], data_offset: u64, data_size: u32) -> Option<&'a [u8]> {
    let start = usize::try_from(data_offset).ok()?;
    let end = start.checked_add(data_size as usize)?;
    data.get(start..end)
}

/// Base blocks are read up to the new block's length; a base file that is
/// too short yields short bytes, which verification then rejects.
fn base_range(base: &[u8], ref_offset: u64, len: u64) -> &[u8] {
    let start = usize::try_from(ref_offset).unwrap_or(usize::MAX).min(base.len());
    let end = usize::try_from(ref_offset.saturating_add(len))
        .unwrap_or(usize::MAX)
        .min(base.len());
    &base[start..end]
}

/// Write every manifest block into `out` at its own offset. Blocks cover
/// disjoint regions, so the order does not matter.
fn reconstruct(
    manifest: &PatchManifest,
    data: &[u8],
    base: Option<&MappedFile>,
    base_path: &Path,
    out: &File,
    out_path: &Path,
) -> Result<()> {
    let raw = |at: u64, data_offset: u64, data_size: u32| {
        blob_range(data, data_offset, data_size).ok_or_else(|| {
            PatchError::corrupt(format!("block {at} points outside the data blob"))
        })
    };

    let mut writer = BufWriter::new(out);
    for (&offset, block) in &manifest.blocks {
        let bytes = match block.source {
            BlockSource::New {
                data_offset,
                data_size,
            } => raw(offset, data_offset, data_size)?,
            BlockSource::Dedup { ref_offset } => match manifest.blocks.get(&ref_offset) {
                Some(target) => match target.source {
                    BlockSource::New {
                        data_offset,
                        data_size,
                    } => raw(ref_offset, data_offset, data_size)?,
                    _ => {
                        return Err(PatchError::corrupt(format!(
                            "block {offset} dedups against block {ref_offset}, which is not a raw block"
                        )))
                    }
                },
                None => {
                    return Err(PatchError::corrupt(format!(
                        "block {offset} dedups against missing block {ref_offset}"
                    )))
                }
            },
            BlockSource::FromBase { ref_offset } => {
                let base = base.ok_or_else(|| PatchError::MissingBaseFile {
                    path: base_path.to_path_buf(),
                })?;
                base_range(base, ref_offset, manifest.block_len(offset))
            }
        };
        writer.seek(SeekFrom::Start(offset)).with_path(out_path)?;
        writer.write_all(bytes).with_path(out_path)?;
    }
    writer.flush().with_path(out_path)
}
