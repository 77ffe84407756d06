use blockpatch::container;
use blockpatch::{
    apply_patch, create_patch, file_fingerprint, fingerprint_file, AppliedPatch, ApplyOptions,
    BlockSource, BuildOptions, Digest, KnownFingerprints, PatchError, DEFAULT_BLOCK_SIZE,
};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

const MB: u64 = DEFAULT_BLOCK_SIZE as u64;

/// Append `count` copies of `byte` to `path`, creating it if needed.
fn fill(path: &Path, byte: u8, count: u64) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(&vec![byte; count as usize]).unwrap();
}

fn fresh(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let _ = fs::remove_file(&path);
    File::create(&path).unwrap();
    path
}

fn full_patch(new_file: &Path, patch: &Path) -> blockpatch::PatchManifest {
    create_patch(
        new_file,
        patch,
        &KnownFingerprints::default(),
        &BuildOptions::default(),
    )
    .unwrap()
}

fn apply(current: &Path, output: &Path, patch: &Path, expected: Option<Digest>) -> AppliedPatch {
    apply_patch(current, output, patch, expected, &ApplyOptions::default()).unwrap()
}

fn hex(s: &str) -> Digest {
    s.parse().unwrap()
}

#[test]
fn test_empty_file() {
    let temp = tempfile::tempdir().unwrap();
    let origin = fresh(temp.path(), "0.orig");
    let patch = temp.path().join("0.patch");
    let result = temp.path().join("0.result");

    let manifest = full_patch(&origin, &patch);
    assert_eq!(manifest.new_hash, hex("d41d8cd98f00b204e9800998ecf8427e"));
    assert_eq!(manifest.blocksize, DEFAULT_BLOCK_SIZE);
    assert_eq!(manifest.size, 0);
    assert!(manifest.blocks.is_empty());

    let applied = apply(&temp.path().join("0.patched"), &result, &patch, None);
    assert!(applied.block_hashes.is_empty());
    assert_eq!(applied.new_hash, manifest.new_hash);
    assert_eq!(fs::read(&result).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_single_short_block() {
    let temp = tempfile::tempdir().unwrap();
    let origin = fresh(temp.path(), "0.orig");
    fill(&origin, 42, 1024);
    let patch = temp.path().join("0.patch");
    let result = temp.path().join("0.result");

    let manifest = full_patch(&origin, &patch);
    assert_eq!(manifest.new_hash, hex("368826d9001ff5f9365790ce1b9dad5f"));
    assert_eq!(manifest.size, 1024);
    assert_eq!(manifest.blocks.len(), 1);
    assert_eq!(
        manifest.blocks[&0].source,
        BlockSource::New {
            data_offset: 0,
            data_size: 1024
        }
    );

    let applied = apply(&temp.path().join("0.patched"), &result, &patch, None);
    assert_eq!(
        applied.block_hashes,
        fingerprint_file(&origin, DEFAULT_BLOCK_SIZE).unwrap()
    );
    assert_eq!(fs::read(&origin).unwrap(), fs::read(&result).unwrap());
}

#[test]
fn test_three_different_blocks() {
    let temp = tempfile::tempdir().unwrap();
    let origin = fresh(temp.path(), "0.orig");
    fill(&origin, 42, MB);
    fill(&origin, 43, MB);
    fill(&origin, 44, MB);
    let patch = temp.path().join("0.patch");
    let result = temp.path().join("0.result");

    let manifest = full_patch(&origin, &patch);
    assert_eq!(manifest.new_hash, hex("a3b48438a106106074da37be30fe21b1"));
    assert_eq!(manifest.size, 3 * MB);

    let expected = [
        (0, "5b99234ef23ac445057d3f6ba4dd4f8c"),
        (MB, "3a7c3c35eee529587f401af6c8646d79"),
        (2 * MB, "36287664b9006f578d81f7f382fe34f6"),
    ];
    assert_eq!(manifest.blocks.len(), 3);
    for (offset, hash) in expected {
        let block = &manifest.blocks[&offset];
        assert_eq!(block.hash, hex(hash));
        assert_eq!(
            block.source,
            BlockSource::New {
                data_offset: offset,
                data_size: DEFAULT_BLOCK_SIZE
            }
        );
    }

    let applied = apply(&temp.path().join("0.patched"), &result, &patch, None);
    assert_eq!(applied.block_hashes.len(), 3);
    assert_eq!(fs::read(&origin).unwrap(), fs::read(&result).unwrap());
}

#[test]
fn test_three_same_blocks() {
    let temp = tempfile::tempdir().unwrap();
    let origin = fresh(temp.path(), "0.orig");
    fill(&origin, 42, 3 * MB);
    let patch = temp.path().join("0.patch");
    let result = temp.path().join("0.result");

    let manifest = full_patch(&origin, &patch);
    assert_eq!(manifest.new_hash, hex("010df07339d2aa72bd408b7489c25958"));
    assert_eq!(
        manifest.blocks[&0].source,
        BlockSource::New {
            data_offset: 0,
            data_size: DEFAULT_BLOCK_SIZE
        }
    );
    for offset in [MB, 2 * MB] {
        assert_eq!(manifest.blocks[&offset].hash, hex("5b99234ef23ac445057d3f6ba4dd4f8c"));
        assert_eq!(
            manifest.blocks[&offset].source,
            BlockSource::Dedup { ref_offset: 0 }
        );
    }
    assert_eq!(manifest.summary().data_bytes, MB);

    let applied = apply(&temp.path().join("0.patched"), &result, &patch, None);
    assert_eq!(applied.block_hashes.len(), 3);
    assert_eq!(fs::read(&origin).unwrap(), fs::read(&result).unwrap());
}

#[test]
fn test_small_blocksize_boundaries() {
    let temp = tempfile::tempdir().unwrap();
    for len in [0usize, 1, 63, 64, 65, 128, 200] {
        let origin = temp.path().join(format!("{len}.orig"));
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 13) as u8).collect();
        fs::write(&origin, &data).unwrap();
        let patch = temp.path().join(format!("{len}.patch"));
        let result = temp.path().join(format!("{len}.result"));

        let options = BuildOptions {
            blocksize: 64,
            scratch_dir: Some(temp.path().to_path_buf()),
        };
        let manifest =
            create_patch(&origin, &patch, &KnownFingerprints::default(), &options).unwrap();
        assert_eq!(manifest.blocks.len(), len.div_ceil(64));

        let applied = apply(&temp.path().join("none"), &result, &patch, None);
        assert_eq!(applied.block_hashes, fingerprint_file(&origin, 64).unwrap());
        assert_eq!(fs::read(&result).unwrap(), data, "length {len}");
    }
}

/// Build a patch from `current`'s state (described by `base`) to `origin`,
/// apply it onto `current`, and check the rebuilt file.
fn chain_step(
    origin: &Path,
    current: &Path,
    patch: &Path,
    base: &AppliedPatch,
) -> (blockpatch::PatchManifest, AppliedPatch) {
    let blocks = fingerprint_file(origin, DEFAULT_BLOCK_SIZE).unwrap();
    let hash = file_fingerprint(&blocks);
    let known = KnownFingerprints {
        new_hash: Some(hash),
        new_blocks: Some(&blocks),
        base_hash: Some(base.new_hash),
        base_blocks: Some(&base.block_hashes),
    };
    let manifest = create_patch(origin, patch, &known, &BuildOptions::default()).unwrap();
    assert_eq!(manifest.old_hash, Some(base.new_hash));

    let applied = apply(current, current, patch, Some(base.new_hash));
    assert_eq!(applied.new_hash, hash);
    assert_eq!(file_fingerprint(&applied.block_hashes), hash);
    assert_eq!(applied.block_hashes, blocks);
    assert_eq!(fs::read(origin).unwrap(), fs::read(current).unwrap());
    (manifest, applied)
}

#[test]
fn test_chained_patches() {
    let temp = tempfile::tempdir().unwrap();
    let origin = fresh(temp.path(), "0.orig");
    let patch = temp.path().join("0.patch");
    let current = temp.path().join("0.patched");

    // Initial full patch of an empty file onto nothing.
    full_patch(&origin, &patch);
    let mut state = apply(&current, &current, &patch, None);
    assert!(state.block_hashes.is_empty());

    // Grow to two kilobytes.
    fill(&origin, 42, 2048);
    state = chain_step(&origin, &current, &patch, &state).1;

    // Overwrite with two full blocks of a different byte.
    let origin = fresh(temp.path(), "0.orig");
    fill(&origin, 43, 2 * MB);
    state = chain_step(&origin, &current, &patch, &state).1;

    // Extend by one identical block: everything comes from the base, and the
    // base's repeated hash resolves to its last offset.
    fill(&origin, 43, MB);
    let (manifest, next) = chain_step(&origin, &current, &patch, &state);
    assert_eq!(manifest.blocks.len(), 3);
    for block in manifest.blocks.values() {
        assert_eq!(block.hash, hex("3a7c3c35eee529587f401af6c8646d79"));
        assert_eq!(block.source, BlockSource::FromBase { ref_offset: MB });
    }
    assert_eq!(manifest.summary().data_bytes, 0);
    state = next;

    // Append mixed blocks and a short tail.
    fill(&origin, 44, MB);
    fill(&origin, 43, MB);
    fill(&origin, 42, MB / 2);
    state = chain_step(&origin, &current, &patch, &state).1;

    // Truncate to half a block.
    let origin = fresh(temp.path(), "0.orig");
    fill(&origin, 42, MB / 2);
    state = chain_step(&origin, &current, &patch, &state).1;

    // Truncate to nothing.
    let origin = fresh(temp.path(), "0.orig");
    state = chain_step(&origin, &current, &patch, &state).1;
    assert!(state.block_hashes.is_empty());
    assert_eq!(fs::metadata(&current).unwrap().len(), 0);
}

#[test]
fn test_wrong_base_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let base = temp.path().join("base");
    fs::write(&base, vec![1u8; 100]).unwrap();
    let new = temp.path().join("new");
    fs::write(&new, vec![2u8; 100]).unwrap();
    let patch = temp.path().join("p");

    let base_blocks = fingerprint_file(&base, 64).unwrap();
    let known = KnownFingerprints {
        base_hash: Some(file_fingerprint(&base_blocks)),
        base_blocks: Some(&base_blocks),
        ..Default::default()
    };
    let options = BuildOptions {
        blocksize: 64,
        scratch_dir: None,
    };
    create_patch(&new, &patch, &known, &options).unwrap();

    let output = temp.path().join("out");
    for expected in [None, Some(Digest::of(b"something else"))] {
        let err = apply_patch(&base, &output, &patch, expected, &ApplyOptions::default())
            .unwrap_err();
        assert!(matches!(err, PatchError::WrongBaseFile { .. }), "{err}");
        assert!(!output.exists());
    }
}

#[test]
fn test_missing_base_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let base = temp.path().join("base");
    fs::write(&base, b"shared block!").unwrap();
    let base_blocks = fingerprint_file(&base, 1024).unwrap();
    let base_hash = file_fingerprint(&base_blocks);
    let patch = temp.path().join("p");

    let known = KnownFingerprints {
        base_hash: Some(base_hash),
        base_blocks: Some(&base_blocks),
        ..Default::default()
    };
    let options = BuildOptions {
        blocksize: 1024,
        scratch_dir: None,
    };
    let manifest = create_patch(&base, &patch, &known, &options).unwrap();
    assert_eq!(manifest.blocks[&0].source, BlockSource::FromBase { ref_offset: 0 });

    let output = temp.path().join("out");
    let err = apply_patch(
        &temp.path().join("gone"),
        &output,
        &patch,
        Some(base_hash),
        &ApplyOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::MissingBaseFile { .. }), "{err}");
    assert!(!output.exists());
    // Only the inputs remain: no scratch or staging files leak.
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 2);
}

#[test]
fn test_corrupted_hash_fails_verification() {
    let temp = tempfile::tempdir().unwrap();
    let origin = temp.path().join("origin");
    fs::write(&origin, b"some content worth patching").unwrap();
    let patch = temp.path().join("good.patch");
    let options = BuildOptions {
        blocksize: 8,
        scratch_dir: None,
    };
    create_patch(&origin, &patch, &KnownFingerprints::default(), &options).unwrap();

    let (mut manifest, blob, len) = container::decode(
        BufReader::new(File::open(&patch).unwrap()),
        Vec::new(),
        &patch,
    )
    .unwrap();
    manifest.blocks.get_mut(&8).unwrap().hash = Digest::of(b"tampered");
    let bad_patch = temp.path().join("bad.patch");
    let out = container::encode(Vec::new(), &manifest, blob.as_slice(), len, &bad_patch).unwrap();
    fs::write(&bad_patch, out).unwrap();

    let output = temp.path().join("out");
    fs::write(&output, b"previous version").unwrap();
    let err = apply_patch(
        &temp.path().join("none"),
        &output,
        &bad_patch,
        None,
        &ApplyOptions::default(),
    )
    .unwrap_err();
    match err {
        PatchError::IntegrityVerificationFailed { expected, actual } => {
            assert_eq!(expected[&8], Digest::of(b"tampered"));
            assert_eq!(actual[&8], Digest::of(b"tent wor"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read(&output).unwrap(), b"previous version");
}

#[test]
fn test_full_patch_ignores_existing_current_file() {
    let temp = tempfile::tempdir().unwrap();
    let origin = temp.path().join("origin");
    fs::write(&origin, b"brand new contents").unwrap();
    let current = temp.path().join("current");
    fs::write(&current, b"unrelated older contents").unwrap();
    let patch = temp.path().join("p");

    full_patch(&origin, &patch);
    apply(&current, &current, &patch, Some(Digest::of(b"ignored")));
    assert_eq!(fs::read(&current).unwrap(), b"brand new contents");
}

#[test]
fn test_full_patch_with_unreadable_current() {
    let temp = tempfile::tempdir().unwrap();
    let origin = temp.path().join("origin");
    fs::write(&origin, b"hello").unwrap();
    let current = temp.path().join("curdir");
    fs::create_dir(&current).unwrap();
    let patch = temp.path().join("p");
    let output = temp.path().join("out");

    let manifest = full_patch(&origin, &patch);
    let applied = apply(&current, &output, &patch, None);
    assert_eq!(applied.new_hash, manifest.new_hash);
    assert_eq!(fs::read(&output).unwrap(), b"hello");
}

fn blockpatch_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_blockpatch"))
}

#[test]
fn test_cli_chain() {
    let temp = tempfile::tempdir().unwrap();
    let v1 = temp.path().join("v1");
    let v2 = temp.path().join("v2");
    let mut v2_data = vec![0xAAu8; 8192];
    fs::write(&v1, &v2_data).unwrap();
    v2_data.extend_from_slice(&[0xBB; 4096]);
    fs::write(&v2, &v2_data).unwrap();

    let target = temp.path().join("target");
    let sig = temp.path().join("target.sig");
    let p1 = temp.path().join("v1.patch");
    let p2 = temp.path().join("v2.patch");
    let exe = blockpatch_exe();

    let run = |args: &[&str]| {
        let output = Command::new(&exe).args(args).output().unwrap();
        assert!(
            output.status.success(),
            "blockpatch {:?} failed:\nstdout: {}\nstderr: {}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    };
    let s = |p: &Path| p.to_str().unwrap().to_string();

    run(&["create", "--new", &s(&v1), "--output", &s(&p1), "--blocksize", "4096"]);
    run(&[
        "apply", "--current", &s(&target), "--output", &s(&target), "--patch", &s(&p1),
        "--write-sig", &s(&sig),
    ]);
    assert_eq!(fs::read(&target).unwrap(), fs::read(&v1).unwrap());

    let base = blockpatch::signature::read_signature(&sig).unwrap();
    run(&[
        "create", "--new", &s(&v2), "--output", &s(&p2), "--blocksize", "4096", "--base-sig",
        &s(&sig),
    ]);
    run(&[
        "apply", "--current", &s(&target), "--output", &s(&target), "--patch", &s(&p2),
        "--expected-base", &base.file_hash.to_hex(),
    ]);
    assert_eq!(fs::read(&target).unwrap(), v2_data);
}
