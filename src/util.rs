use memmap2::Mmap;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;

use crate::error::{IoResultExt, PatchError, Result};

/// Read-only view of a whole file. Empty files are never mapped.
pub enum MappedFile {
    Empty,
    Mapped(Mmap),
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MappedFile::Empty => &[],
            MappedFile::Mapped(map) => &map[..],
        }
    }
}

/// Memory-map an open file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the mapping is live.
pub fn map_file(file: &File, path: &Path) -> Result<MappedFile> {
    let len = file.metadata().with_path(path)?.len();
    if len == 0 {
        return Ok(MappedFile::Empty);
    }
    // SAFETY: We only read from this mapping; the files are private to one build/apply call
    // or owned by the caller for its duration.
    let map = unsafe { Mmap::map(file) }.with_path(path)?;
    Ok(MappedFile::Mapped(map))
}

pub fn mmap_path(path: &Path) -> Result<MappedFile> {
    let file = File::open(path).with_path(path)?;
    map_file(&file, path)
}

/// Directory for scratch files: the caller's choice, else the directory the
/// final file lands in, so the closing rename stays on one filesystem.
pub fn scratch_dir_for(explicit: Option<&Path>, output: &Path) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Private file next to `output` that later replaces it in one rename.
/// Dropping it without persisting removes it.
pub fn staging_file(output: &Path) -> Result<NamedTempFile> {
    let dir = scratch_dir_for(None, output);
    tempfile::Builder::new()
        .prefix(".blockpatch-")
        .tempfile_in(&dir)
        .with_path(dir)
}

/// Atomically move a staged file over `output`.
pub fn commit_staged(staged: NamedTempFile, output: &Path) -> Result<()> {
    staged
        .as_file()
        .sync_all()
        .with_path(staged.path().to_path_buf())?;
    staged
        .persist(output)
        .map(|_| ())
        .map_err(|e| PatchError::io(output, e.error))
}

/// Modification time in milliseconds since the Unix epoch, 0 when unavailable.
pub fn modified_millis(file: &File) -> u64 {
    file.metadata()
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |age| age.as_millis() as u64)
}
