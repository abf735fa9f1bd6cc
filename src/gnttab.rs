//! Grant-table map/unmap: the lowest-level hypervisor collaborator.
//!
//! Deliberately out of the core per §1 ("the low-level grant-table map/unmap
//! calls" are plumbing); implemented for real against `/dev/xen/gntdev`
//! rather than stubbed, same spirit as `perunner::iofile` wrapping real
//! syscalls behind a small owned type.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

const GNTDEV_PATH: &str = "/dev/xen/gntdev";

/// ioctl numbers from the public gntdev ABI (`IOCTL_GNTDEV_MAP_GRANT_REF`,
/// `IOCTL_GNTDEV_UNMAP_GRANT_REF`), computed with the same `_IOC` encoding
/// the kernel header uses.
const IOCTL_GNTDEV_MAP_GRANT_REF: u64 = 0xC020_4700;
const IOCTL_GNTDEV_UNMAP_GRANT_REF: u64 = 0xC018_4701;

#[repr(C)]
struct IoctlGntdevGrantRef {
    domid: u32,
    reference: u32,
}

#[repr(C)]
struct IoctlGntdevMapGrantRef {
    count: u32,
    _pad: u32,
    index: u64,
    refs: [IoctlGntdevGrantRef; 1],
}

#[repr(C)]
struct IoctlGntdevUnmapGrantRef {
    index: u64,
    count: u32,
    _pad: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("opening {GNTDEV_PATH}: {0}")]
    Open(#[source] std::io::Error),
    #[error("mapping grant ref {gref}: {source}")]
    Map { gref: u32, source: std::io::Error },
    #[error("mmap of mapped grant failed: {0}")]
    Mmap(#[source] std::io::Error),
    #[error("unmapping grant at {page:p}: {source}")]
    Unmap {
        page: *mut u8,
        source: std::io::Error,
    },
}

// `*mut u8` inside the error keeps Debug/Display simple; it's never
// dereferenced by the error path and Send is fine because we never share the
// page across threads at that point.
unsafe impl Send for Error {}
unsafe impl Sync for Error {}

/// What the Grant Cache needs from the hypervisor's grant-table facility.
/// Abstracted so the cache's eviction/promotion logic is independently
/// testable without a real `/dev/xen/gntdev` node present.
pub trait GrantMap {
    fn map(&mut self, gref: u32) -> Result<*mut u8, Error>;
    fn unmap(&mut self, gref: u32, page: *mut u8) -> Result<(), Error>;
}

/// Real grant-table collaborator: one open fd to `/dev/xen/gntdev`, mapping
/// each grant reference into the backend's address space with read+write
/// protection via mmap on the fd at the index the kernel returns.
pub struct Gnttab {
    fd: File,
    domid: u32,
}

impl Gnttab {
    pub fn open(domid: u32) -> Result<Gnttab, Error> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(GNTDEV_PATH)
            .map_err(Error::Open)?;
        Ok(Gnttab { fd, domid })
    }
}

impl GrantMap for Gnttab {
    fn map(&mut self, gref: u32) -> Result<*mut u8, Error> {
        let mut req = IoctlGntdevMapGrantRef {
            count: 1,
            _pad: 0,
            index: 0,
            refs: [IoctlGntdevGrantRef {
                domid: self.domid,
                reference: gref,
            }],
        };

        let rc = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                IOCTL_GNTDEV_MAP_GRANT_REF as _,
                &mut req as *mut _,
            )
        };
        if rc != 0 {
            return Err(Error::Map {
                gref,
                source: std::io::Error::last_os_error(),
            });
        }

        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                crate::wire::PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                req.index as libc::off_t,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(Error::Mmap(std::io::Error::last_os_error()));
        }
        Ok(page as *mut u8)
    }

    fn unmap(&mut self, _gref: u32, page: *mut u8) -> Result<(), Error> {
        let rc = unsafe { libc::munmap(page as *mut libc::c_void, crate::wire::PAGE_SIZE) };
        if rc != 0 {
            return Err(Error::Unmap {
                page,
                source: std::io::Error::last_os_error(),
            });
        }

        let mut req = IoctlGntdevUnmapGrantRef {
            index: 0,
            count: 1,
            _pad: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                IOCTL_GNTDEV_UNMAP_GRANT_REF as _,
                &mut req as *mut _,
            )
        };
        if rc != 0 {
            return Err(Error::Unmap {
                page,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}
