//! `us-blkback-mkimage`: pre-create a zero-filled raw-sectors backing file.
//!
//! Grounded in the original's `disk-image-util` companion tool
//! (`createBackingFile`): given a path, a sector count and a sector size,
//! write out a zero-filled file of exactly `sector_count * sector_size`
//! bytes so it's ready for `ImageStore::open`.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "us-blkback-mkimage", about = "Create a zero-filled raw disk image")]
struct Args {
    /// Path of the image file to create.
    path: std::path::PathBuf,

    /// Number of 512-byte (or `--sector-size`) sectors.
    sector_count: u64,

    /// Sector size in bytes.
    #[arg(default_value_t = 512)]
    sector_size: u64,
}

fn create_backing_file(path: &std::path::Path, sector_count: u64, sector_size: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    let total = sector_count * sector_size;
    const CHUNK: usize = 1 << 20;
    let zeros = vec![0u8; CHUNK];
    let mut remaining = total;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.flush()
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match create_backing_file(&args.path, args.sector_count, args.sector_size) {
        Ok(()) => {
            log::info!(
                "created {} ({} sectors x {} bytes)",
                args.path.display(),
                args.sector_count,
                args.sector_size
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("failed to create {}: {e}", args.path.display());
            ExitCode::FAILURE
        }
    }
}
