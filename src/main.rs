//! `us-blkback` process entry point: argument parsing, CPU affinity,
//! orderly SIGINT/SIGTERM shutdown, and the Backend Supervisor's lifetime.
//! Frontend discovery itself (watching the hypervisor-store for new
//! frontend directories) is genuinely external plumbing per §1 and is not
//! modeled here; `us_blkback::supervisor::Supervisor` is exercised directly
//! by whatever discovers a frontend path and hands it to `Frontend::bind`.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;

use us_blkback::cli::Args;
use us_blkback::supervisor::Supervisor;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_stop_signal as libc::sighandler_t);
    }
}

#[derive(Debug, thiserror::Error)]
enum Fatal {
    #[error("setting CPU affinity to {cpu}: {source}")]
    Affinity { cpu: usize, source: std::io::Error },
}

fn online_cpu_count() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

fn set_affinity(cpu: usize) -> Result<(), Fatal> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(Fatal::Affinity {
                cpu,
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

/// Poll `/dev/xen/gntdev` and `/dev/xen/evtchn` until both exist, for
/// `--wait`, rather than failing immediately at startup.
fn wait_for_hypervisor_interface() {
    loop {
        let gntdev = std::path::Path::new("/dev/xen/gntdev").exists();
        let evtchn = std::path::Path::new("/dev/xen/evtchn").exists();
        if gntdev && evtchn {
            return;
        }
        log::info!("waiting for hypervisor interface driver...");
        thread::sleep(Duration::from_millis(500));
    }
}

fn run(args: Args) -> Result<(), Fatal> {
    let cpu = args.affinity.unwrap_or_else(|| online_cpu_count() - 1);
    set_affinity(cpu)?;
    log::info!("pinned to cpu {cpu}");

    if args.wait {
        wait_for_hypervisor_interface();
    }

    install_signal_handlers();

    let supervisor = Supervisor::new();
    log::info!("backend supervisor started, cap={}", us_blkback::supervisor::MAX_FRONTENDS);

    while !STOP.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
    }

    log::info!(
        "shutting down, {} frontends were connected",
        supervisor.frontend_count()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    #[cfg(windows)]
    if args.windows_svc {
        log::info!("windows service mode is not implemented in this build");
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
