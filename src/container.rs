//! Patch artifact container: a tar archive with two entries, `data` (raw
//! block bytes) and `info` (the JSON manifest). Entry order does not matter
//! when reading.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tar::{Archive, Builder, Header};
use tracing::debug;

use crate::error::{IoResultExt, PatchError, Result};
use crate::patch_format::{PatchManifest, DATA_ENTRY, INFO_ENTRY};
use crate::util::{self, MappedFile};

/// A decoded artifact with its data blob mapped for random access.
pub struct PatchArtifact {
    pub manifest: PatchManifest,
    pub data: MappedFile,
}

fn entry_header(size: u64, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header
}

/// Write `manifest` and `data_len` bytes of `data` as an archive into `out`.
/// `label` names the destination in error messages.
pub fn encode<W: Write, R: Read>(
    out: W,
    manifest: &PatchManifest,
    data: R,
    data_len: u64,
    label: &Path,
) -> Result<W> {
    let mtime = manifest.modified_time / 1000;
    let mut builder = Builder::new(out);

    let mut header = entry_header(data_len, mtime);
    builder
        .append_data(&mut header, DATA_ENTRY, data.take(data_len))
        .with_path(label)?;

    let info = manifest.to_json()?;
    let mut header = entry_header(info.len() as u64, mtime);
    builder
        .append_data(&mut header, INFO_ENTRY, info.as_slice())
        .with_path(label)?;

    builder.into_inner().with_path(label)
}

/// Read an archive from `input`, streaming the data entry into `data_sink`.
/// Returns the manifest, the sink and the number of data bytes written to it.
pub fn decode<R: Read, D: Write>(
    input: R,
    mut data_sink: D,
    label: &Path,
) -> Result<(PatchManifest, D, u64)> {
    let unreadable = |e: io::Error| {
        PatchError::corrupt(format!("unreadable archive {}: {e}", label.display()))
    };

    let mut archive = Archive::new(input);
    let mut info: Option<Vec<u8>> = None;
    let mut data_len: Option<u64> = None;

    for entry in archive.entries().map_err(unreadable)? {
        let mut entry = entry.map_err(unreadable)?;
        let name = entry.path().map_err(unreadable)?.to_string_lossy().into_owned();
        let repeated = match name.as_str() {
            INFO_ENTRY => info.is_some(),
            DATA_ENTRY => data_len.is_some(),
            _ => false,
        };
        if repeated {
            return Err(PatchError::corrupt(format!(
                "archive {} holds more than one {name} entry",
                label.display()
            )));
        }
        match name.as_str() {
            INFO_ENTRY => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).map_err(unreadable)?;
                info = Some(buf);
            }
            DATA_ENTRY => {
                let copied = io::copy(&mut entry, &mut data_sink).with_path(label)?;
                data_len = Some(copied);
            }
            other => debug!(entry = other, "skipping unknown archive entry"),
        }
    }

    let info = info.ok_or_else(|| PatchError::corrupt("archive has no info entry"))?;
    let data_len = data_len.ok_or_else(|| PatchError::corrupt("archive has no data entry"))?;
    data_sink.flush().with_path(label)?;

    let manifest = PatchManifest::from_json(&info)?;
    manifest.validate(data_len)?;
    Ok((manifest, data_sink, data_len))
}

/// Write the artifact into `out` from a manifest and its data blob file.
/// `path` names `out` in error messages.
pub fn write_artifact(
    out: &File,
    path: &Path,
    manifest: &PatchManifest,
    data: &mut File,
) -> Result<()> {
    let data_len = data.metadata().with_path(path)?.len();
    data.rewind().with_path(path)?;
    let writer = encode(BufWriter::new(out), manifest, &mut *data, data_len, path)?;
    writer
        .into_inner()
        .map_err(|e| PatchError::io(path, e.into_error()))?;
    out.sync_all().with_path(path)
}

/// Open the artifact at `path`, unpacking its data blob into an anonymous
/// scratch file inside `scratch_dir`. The scratch file disappears once the
/// returned artifact is dropped.
pub fn read_artifact(path: &Path, scratch_dir: &Path) -> Result<PatchArtifact> {
    let file = File::open(path).with_path(path)?;
    let blob = tempfile::tempfile_in(scratch_dir).with_path(scratch_dir)?;
    let (manifest, blob, data_len) =
        decode(BufReader::new(file), BufWriter::new(blob), path)?;
    let blob = blob
        .into_inner()
        .map_err(|e| PatchError::io(scratch_dir, e.into_error()))?;
    debug!(
        artifact = %path.display(),
        blocks = manifest.blocks.len(),
        data_len,
        "decoded patch artifact"
    );
    let data = util::map_file(&blob, scratch_dir)?;
    Ok(PatchArtifact { manifest, data })
}
