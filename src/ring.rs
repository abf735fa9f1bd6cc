//! The shared-memory producer/consumer ring between frontend and backend.
//!
//! Layout mirrors the real block-interface ring: a small header carrying the
//! four production/consumption indices, followed by a flat array of fixed
//! size slots that hold a request while the frontend owns them and are
//! overwritten with a response once the backend is done, exactly the
//! `blkif_sring_t` + `union blkif_sring_entry` shape from the public ABI.
//!
//! This module only knows about raw bytes and indices; it has no opinion on
//! how the page got mapped (that's `gnttab`'s job) or on request semantics
//! (that's `engine`'s job).

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::wire::{RawRequest, Response, BLKIF_REQUEST_SIZE, BLKIF_RESPONSE_SIZE, PAGE_SIZE};

/// Header reserved at the front of the shared page, padded out to 64 bytes
/// the way the real `blkif_sring_t` pads to a cacheline before the slot
/// array starts.
const HEADER_SIZE: usize = 64;

/// One ring slot is sized to the larger of request/response (the request,
/// since responses are smaller and reuse the same storage in place).
const SLOT_SIZE: usize = BLKIF_REQUEST_SIZE;

/// `__CONST_RING_SIZE(blkif, page_size)`.
pub const fn ring_size(page_size: usize) -> usize {
    (page_size - HEADER_SIZE) / SLOT_SIZE
}

const _: () = assert!(BLKIF_RESPONSE_SIZE <= SLOT_SIZE);

#[repr(C)]
struct Header {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
}

/// A mapped shared ring page, owned by exactly one `Frontend`.
///
/// `ptr` points at a page-sized mapping obtained by mapping the frontend's
/// `ring-ref` grant (see `gnttab`); the ring is the only thing that touches
/// that mapping, so no interior locking is needed beyond the atomics baked
/// into the wire header itself (the frontend may be reading `rsp_prod`
/// concurrently with us writing it).
pub struct Ring {
    ptr: *mut u8,
    size: usize,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

unsafe impl Send for Ring {}

impl Ring {
    /// `ptr` must point at a `page_size`-byte mapping of the frontend's
    /// shared ring page, valid for as long as this `Ring` lives.
    pub unsafe fn new(ptr: *mut u8, page_size: usize) -> Ring {
        let header = &*(ptr as *const Header);
        header.req_prod.store(0, Ordering::Relaxed);
        header.req_event.store(1, Ordering::Relaxed);
        header.rsp_prod.store(0, Ordering::Relaxed);
        header.rsp_event.store(1, Ordering::Relaxed);
        Ring {
            ptr,
            size: ring_size(page_size),
            req_cons: 0,
            rsp_prod_pvt: 0,
        }
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.ptr as *const Header) }
    }

    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        let slot = (idx as usize) % self.size;
        unsafe { self.ptr.add(HEADER_SIZE + slot * SLOT_SIZE) }
    }

    /// Pop the next request the frontend has produced, if any. Returns
    /// `None` when the consumer has caught up to the producer.
    pub fn pop_request(&mut self) -> Option<RawRequest> {
        let req_prod = self.header().req_prod.load(Ordering::Acquire);
        if self.req_cons == req_prod {
            return None;
        }
        // Matches the real ring.h: a read memory barrier between observing
        // req_prod and reading the slot contents it guards.
        fence(Ordering::Acquire);

        let slot = self.slot_ptr(self.req_cons);
        let raw = unsafe { std::ptr::read_unaligned(slot as *const RawRequest) };
        self.req_cons = self.req_cons.wrapping_add(1);
        Some(raw)
    }

    /// Write a response into the next response slot and bump `rsp_prod`.
    /// Responses are posted in completion order, which on a single serial
    /// worker is the same as arrival order (§5).
    pub fn push_response(&mut self, resp: Response) {
        let slot = self.slot_ptr(self.rsp_prod_pvt);
        unsafe { std::ptr::write_unaligned(slot as *mut Response, resp) };
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        fence(Ordering::Release);
        self.header()
            .rsp_prod
            .store(self.rsp_prod_pvt, Ordering::Release);
    }

    /// Whether the frontend asked to be notified for the responses posted
    /// since the last signal (event-index style, mirroring
    /// `vring.needs_notification()` in the vhost-user teacher).
    pub fn needs_notification(&self, prev_rsp_prod: u32) -> bool {
        let rsp_event = self.header().rsp_event.load(Ordering::Acquire);
        self.rsp_prod_pvt.wrapping_sub(rsp_event).wrapping_sub(1)
            < self.rsp_prod_pvt.wrapping_sub(prev_rsp_prod)
    }

    pub fn rsp_prod(&self) -> u32 {
        self.rsp_prod_pvt
    }
}
