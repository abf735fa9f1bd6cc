//! Command-line options, per §6. Deliberately out of the core per §1; a
//! thin `clap` derive struct, matching the options table rather than the
//! original's hand-rolled `cxxopts` parsing.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "us-blkback", version, about = "Userspace block-device backend")]
pub struct Args {
    /// Pin the process to this CPU index; failure is fatal.
    #[arg(short, long)]
    pub affinity: Option<usize>,

    /// Poll the hypervisor-interface driver until it is ready, rather than
    /// failing at startup.
    #[arg(short, long)]
    pub wait: bool,

    /// Run as a managed platform service; after this completes, the
    /// process exits 0.
    #[cfg(windows)]
    #[arg(long = "windows-svc")]
    pub windows_svc: bool,

    /// Elevate process priority.
    #[cfg(windows)]
    #[arg(long = "high-priority")]
    pub high_priority: bool,
}
