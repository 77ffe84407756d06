use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::container;
use crate::error::{IoResultExt, PatchError, Result};
use crate::fingerprint::{
    self, check_blocksize, file_fingerprint, BlockHashes, Digest, DEFAULT_BLOCK_SIZE,
};
use crate::patch_format::{BlockSource, PatchBlock, PatchManifest};
use crate::util;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub blocksize: u32,
    /// Where the raw-data scratch file goes. Defaults to the directory of the
    /// output artifact.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            blocksize: DEFAULT_BLOCK_SIZE,
            scratch_dir: None,
        }
    }
}

/// Fingerprints the caller already holds, so the builder can skip hashing.
///
/// Supplying `base_hash` or `base_blocks` makes the patch differential: the
/// manifest records the base identity and may pull blocks from the base file.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownFingerprints<'a> {
    pub new_hash: Option<Digest>,
    pub new_blocks: Option<&'a BlockHashes>,
    pub base_hash: Option<Digest>,
    pub base_blocks: Option<&'a BlockHashes>,
}

/// Build a patch that turns the base (or nothing) into `new_file`, write it to
/// `output` and return its manifest.
///
/// Each block of the new file, in offset order, becomes the first match of:
/// a dedup of an earlier raw block of the same file, a reference into the
/// base file, or raw bytes appended to the data blob.
pub fn create_patch(
    new_file: &Path,
    output: &Path,
    known: &KnownFingerprints<'_>,
    options: &BuildOptions,
) -> Result<PatchManifest> {
    let blocksize = options.blocksize;
    check_blocksize(blocksize)?;
    let scratch_dir = util::scratch_dir_for(options.scratch_dir.as_deref(), output);

    let file = File::open(new_file).with_path(new_file)?;
    let modified_time = util::modified_millis(&file);
    let content = util::map_file(&file, new_file)?;
    let size = content.len() as u64;
    debug!(file = %new_file.display(), size, blocksize, "creating patch");

    let computed;
    let new_blocks = match known.new_blocks {
        Some(blocks) => blocks,
        None => {
            computed = fingerprint::fingerprint_bytes(&content, blocksize)?;
            &computed
        }
    };
    let new_hash = known
        .new_hash
        .unwrap_or_else(|| file_fingerprint(new_blocks));

    let old_hash = match (known.base_hash, known.base_blocks) {
        (Some(hash), _) => Some(hash),
        (None, Some(blocks)) => Some(file_fingerprint(blocks)),
        (None, None) => None,
    };
    // A hash occurring twice in the base resolves to its last offset.
    let base_by_hash: HashMap<Digest, u64> = known
        .base_blocks
        .into_iter()
        .flatten()
        .map(|(&offset, &hash)| (hash, offset))
        .collect();

    let blob = tempfile::tempfile_in(&scratch_dir).with_path(&scratch_dir)?;
    let mut data = BufWriter::new(blob);
    let mut seen_in_patch: HashMap<Digest, u64> = HashMap::new();
    let mut blocks = BTreeMap::new();
    let mut cursor = 0u64;

    for (&offset, &hash) in new_blocks {
        let source = if let Some(&ref_offset) = seen_in_patch.get(&hash) {
            BlockSource::Dedup { ref_offset }
        } else if let Some(&ref_offset) = base_by_hash.get(&hash) {
            BlockSource::FromBase { ref_offset }
        } else {
            let bytes = block_at(&content, offset, blocksize).ok_or_else(|| {
                PatchError::io(
                    new_file,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("block hashes name offset {offset}, past the end of the file"),
                    ),
                )
            })?;
            data.write_all(bytes).with_path(&scratch_dir)?;
            let data_size = bytes.len() as u32;
            let source = BlockSource::New {
                data_offset: cursor,
                data_size,
            };
            cursor += data_size as u64;
            seen_in_patch.insert(hash, offset);
            source
        };
        blocks.insert(offset, PatchBlock::new(hash, source));
    }

    let mut blob = data
        .into_inner()
        .map_err(|e| PatchError::io(&scratch_dir, e.into_error()))?;
    drop(content);

    let manifest = PatchManifest {
        blocksize,
        size,
        modified_time,
        new_hash,
        old_hash,
        blocks,
    };

    let staged = util::staging_file(output)?;
    container::write_artifact(staged.as_file(), staged.path(), &manifest, &mut blob)?;
    util::commit_staged(staged, output)?;

    let summary = manifest.summary();
    info!(
        patch = %output.display(),
        new_blocks = summary.new_blocks,
        dedup_blocks = summary.dedup_blocks,
        base_blocks = summary.base_blocks,
        data_bytes = summary.data_bytes,
        differential = manifest.is_differential(),
        "patch created"
    );
    Ok(manifest)
}

fn block_at(content: &[u8], offset: u64, blocksize: u32) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    if start >= content.len() {
        return None;
    }
    let end = start.saturating_add(blocksize as usize).min(content.len());
    content.get(start..end)
}
