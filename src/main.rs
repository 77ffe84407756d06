use anyhow::{bail, Context};
use blockpatch::signature::{self, Signature};
use blockpatch::{ApplyOptions, BuildOptions, Digest, KnownFingerprints, DEFAULT_BLOCK_SIZE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blockpatch", about = "Block-level file patch creator and applier")]
struct Cli {
    /// Log every build/apply phase
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the block signature of a file
    Signature {
        /// File to fingerprint
        #[arg(long)]
        file: PathBuf,
        /// Output path for the signature file
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        blocksize: u32,
    },
    /// Create a patch for a new file, optionally against a base signature
    Create {
        /// Path to the new file
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Signature of the base file the receiver holds
        #[arg(long)]
        base_sig: Option<PathBuf>,
        /// Also write the new file's signature here
        #[arg(long)]
        write_sig: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        blocksize: u32,
        /// Directory for scratch files (defaults to the output directory)
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
    },
    /// Apply a patch, rebuilding the target file
    Apply {
        /// Current (base) file; may not exist for full patches
        #[arg(long)]
        current: PathBuf,
        /// Where the rebuilt file is written
        #[arg(long, short)]
        output: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Fingerprint of the current file, required for differential patches
        #[arg(long)]
        expected_base: Option<Digest>,
        /// Also write the rebuilt file's signature here
        #[arg(long)]
        write_sig: Option<PathBuf>,
        /// Directory for scratch files (defaults to the output directory)
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Signature {
            file,
            output,
            blocksize,
        } => {
            let start = Instant::now();
            let signature = tokio::task::spawn_blocking(move || -> anyhow::Result<Signature> {
                let signature = Signature::of_file(&file, blocksize)
                    .with_context(|| format!("Failed to fingerprint {}", file.display()))?;
                signature::write_signature(&output, &signature)
                    .with_context(|| format!("Failed to write signature {}", output.display()))?;
                Ok(signature)
            })
            .await??;

            println!("Signature written.");
            println!("  File hash: {}", signature.file_hash);
            println!("  Blocks: {}", signature.blocks.len());
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Create {
            new,
            output,
            base_sig,
            write_sig,
            blocksize,
            scratch_dir,
        } => {
            println!("Creating patch...");
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let manifest = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let base = match &base_sig {
                    Some(path) => Some(signature::read_signature(path).with_context(|| {
                        format!("Failed to read base signature {}", path.display())
                    })?),
                    None => None,
                };
                if let Some(base) = &base {
                    if base.blocksize != blocksize {
                        bail!(
                            "Base signature uses block size {}, but the patch uses {}",
                            base.blocksize,
                            blocksize
                        );
                    }
                }

                let known = KnownFingerprints {
                    base_hash: base.as_ref().map(|b| b.file_hash),
                    base_blocks: base.as_ref().map(|b| &b.blocks),
                    ..Default::default()
                };
                let options = BuildOptions {
                    blocksize,
                    scratch_dir,
                };
                let manifest = blockpatch::create_patch(&new, &output, &known, &options)
                    .with_context(|| format!("Failed to create patch for {}", new.display()))?;

                if let Some(sig_path) = &write_sig {
                    let signature = Signature::new(blocksize, manifest.block_hashes());
                    signature::write_signature(sig_path, &signature).with_context(|| {
                        format!("Failed to write signature {}", sig_path.display())
                    })?;
                }
                Ok(manifest)
            })
            .await??;

            let summary = manifest.summary();
            println!("\nPatch created successfully!");
            println!("  New hash: {}", manifest.new_hash);
            if let Some(old_hash) = manifest.old_hash {
                println!("  Base hash: {}", old_hash);
            }
            println!("  Raw blocks: {}", summary.new_blocks);
            println!("  Deduplicated blocks: {}", summary.dedup_blocks);
            println!("  Blocks from base: {}", summary.base_blocks);
            println!("  Raw data: {} bytes", summary.data_bytes);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Apply {
            current,
            output,
            patch,
            expected_base,
            write_sig,
            scratch_dir,
        } => {
            println!("Applying patch...");
            println!("  Current: {}", current.display());
            println!("  Patch: {}", patch.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let applied = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                let options = ApplyOptions { scratch_dir };
                let applied =
                    blockpatch::apply_patch(&current, &output, &patch, expected_base, &options)
                        .with_context(|| format!("Failed to apply patch {}", patch.display()))?;

                if let Some(sig_path) = &write_sig {
                    let signature = Signature::new(applied.blocksize, applied.block_hashes.clone());
                    signature::write_signature(sig_path, &signature).with_context(|| {
                        format!("Failed to write signature {}", sig_path.display())
                    })?;
                }
                Ok(applied)
            })
            .await??;

            println!("\nPatch applied successfully!");
            println!("  New hash: {}", applied.new_hash);
            println!("  Blocks: {}", applied.block_hashes.len());
            println!("  Raw blocks: {}", applied.summary.new_blocks);
            println!("  Deduplicated blocks: {}", applied.summary.dedup_blocks);
            println!("  Blocks from base: {}", applied.summary.base_blocks);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
    }

    Ok(())
}
