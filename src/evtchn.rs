//! Event-channel notification primitive.
//!
//! Deliberately out of the core per §1; implemented for real against
//! `/dev/xen/evtchn`, kept behind an `EventChannel` trait so the Request
//! Engine's loop only ever calls `wait()`/`notify()` and never opens a
//! device node itself.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;

const EVTCHN_PATH: &str = "/dev/xen/evtchn";

const IOCTL_EVTCHN_BIND_INTERDOMAIN: u64 = 0xC008_4500;
const IOCTL_EVTCHN_NOTIFY: u64 = 0xC004_4502;

#[repr(C)]
struct IoctlBindInterdomain {
    remote_domain: u32,
    remote_port: u32,
}

#[repr(C)]
struct IoctlNotify {
    port: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("opening {EVTCHN_PATH}: {0}")]
    Open(#[source] std::io::Error),
    #[error("binding event channel: {0}")]
    Bind(#[source] std::io::Error),
    #[error("waiting on event channel: {0}")]
    Wait(#[source] std::io::Error),
    #[error("notifying event channel: {0}")]
    Notify(#[source] std::io::Error),
}

/// What the Request Engine's loop needs from the hypervisor's notification
/// facility: block until a notification arrives, and post one when a batch
/// of responses has been pushed.
pub trait EventChannel {
    fn wait(&mut self) -> Result<(), Error>;
    fn notify(&mut self) -> Result<(), Error>;
}

pub struct EvtChnHandle {
    fd: File,
    port: u32,
}

impl EvtChnHandle {
    pub fn bind(remote_domain: u32, remote_port: u32) -> Result<EvtChnHandle, Error> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(EVTCHN_PATH)
            .map_err(Error::Open)?;

        let mut req = IoctlBindInterdomain {
            remote_domain,
            remote_port,
        };
        let port = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                IOCTL_EVTCHN_BIND_INTERDOMAIN as _,
                &mut req as *mut _,
            )
        };
        if port < 0 {
            return Err(Error::Bind(std::io::Error::last_os_error()));
        }

        Ok(EvtChnHandle {
            fd,
            port: port as u32,
        })
    }
}

impl EventChannel for EvtChnHandle {
    /// Blocks until the kernel delivers a port number on the fd, the same
    /// blocking-read convention the real evtchn device uses to signal a
    /// pending notification.
    fn wait(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        (&self.fd).read_exact(&mut buf).map_err(Error::Wait)?;
        Ok(())
    }

    fn notify(&mut self) -> Result<(), Error> {
        let mut req = IoctlNotify { port: self.port };
        let rc = unsafe {
            libc::ioctl(self.fd.as_raw_fd(), IOCTL_EVTCHN_NOTIFY as _, &mut req as *mut _)
        };
        if rc != 0 {
            return Err(Error::Notify(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

// Unblock the file descriptor manually where a test wants to drive `wait()`
// without a real device node; kept private since only this module's tests
// construct one.
#[cfg(test)]
pub mod tests {
    use super::*;
    use std::cell::Cell;

    /// An in-memory stand-in used by `frontend`'s and `supervisor`'s own
    /// tests: `notify()` just counts calls, `wait()` always returns
    /// immediately so tests never block.
    pub struct FakeEventChannel {
        pub notify_calls: Cell<u32>,
    }

    impl FakeEventChannel {
        pub fn new() -> FakeEventChannel {
            FakeEventChannel {
                notify_calls: Cell::new(0),
            }
        }
    }

    impl EventChannel for FakeEventChannel {
        fn wait(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn notify(&mut self) -> Result<(), Error> {
            self.notify_calls.set(self.notify_calls.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn fake_counts_notifications() {
        let mut ch = FakeEventChannel::new();
        ch.notify().unwrap();
        ch.notify().unwrap();
        assert_eq!(ch.notify_calls.get(), 2);
    }
}
