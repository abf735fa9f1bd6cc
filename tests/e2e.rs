//! End-to-end tests driving the public API the way a real bind/drain/close
//! sequence would: Supervisor admits a frontend, Frontend::bind wires up a
//! fake store/grant-map/event-channel, and requests are pushed onto the
//! ring the way a guest frontend would before the engine's loop drains it.
//!
//! These fakes are defined locally rather than reused from the library's
//! own `#[cfg(test)]` modules: those aren't part of the crate's public
//! surface an integration test binary links against.

use std::collections::HashMap;
use std::io::Write as _;

use us_blkback::evtchn::{Error as EvtChnError, EventChannel};
use us_blkback::frontend::Frontend;
use us_blkback::gnttab::{Error as GrantMapError, GrantMap};
use us_blkback::supervisor::{Supervisor, MAX_FRONTENDS};
use us_blkback::wire::{
    RawRequest, RequestDirect, SegmentDescriptor, BLKIF_MAX_SEGMENTS_PER_REQUEST, BLKIF_OP_READ,
    BLKIF_OP_WRITE, BLKIF_REQUEST_SIZE, PAGE_SIZE, SECTOR_SIZE,
};
use us_blkback::xenstore::{Error as StoreError, Store};
use zerocopy::byteorder::little_endian::{U16, U32, U64};

struct FakeGrantMap {
    live: HashMap<u32, *mut u8>,
    // grefs bound to a caller-owned buffer via `register`, never boxed by
    // this fake and so never freed by `unmap`.
    foreign: std::collections::HashSet<u32>,
}

impl FakeGrantMap {
    fn new() -> FakeGrantMap {
        FakeGrantMap {
            live: HashMap::new(),
            foreign: std::collections::HashSet::new(),
        }
    }

    /// Bind `gref` to the ring page the test itself owns, so pushing
    /// requests onto that page is visible through the mapping `bind()`
    /// resolves internally.
    fn register(&mut self, gref: u32, page: *mut u8) {
        self.live.insert(gref, page);
        self.foreign.insert(gref);
    }
}

impl GrantMap for FakeGrantMap {
    fn map(&mut self, gref: u32) -> Result<*mut u8, GrantMapError> {
        if let Some(&page) = self.live.get(&gref) {
            return Ok(page);
        }
        let page = Box::leak(Box::new([0u8; PAGE_SIZE])).as_mut_ptr();
        self.live.insert(gref, page);
        Ok(page)
    }

    fn unmap(&mut self, gref: u32, page: *mut u8) -> Result<(), GrantMapError> {
        self.live.remove(&gref);
        if self.foreign.remove(&gref) {
            return Ok(());
        }
        unsafe { drop(Box::from_raw(page as *mut [u8; PAGE_SIZE])) };
        Ok(())
    }
}

struct FakeEventChannel {
    notify_calls: u32,
}

impl FakeEventChannel {
    fn new() -> FakeEventChannel {
        FakeEventChannel { notify_calls: 0 }
    }
}

impl EventChannel for FakeEventChannel {
    fn wait(&mut self) -> Result<(), EvtChnError> {
        Ok(())
    }

    fn notify(&mut self) -> Result<(), EvtChnError> {
        self.notify_calls += 1;
        Ok(())
    }
}

struct FakeStore {
    kv: HashMap<String, String>,
}

impl FakeStore {
    fn new() -> FakeStore {
        FakeStore { kv: HashMap::new() }
    }
}

impl Store for FakeStore {
    fn read(&mut self, path: &str) -> Result<String, StoreError> {
        self.kv
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: path.to_string(),
            })
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), StoreError> {
        self.kv.insert(path.to_string(), value.to_string());
        Ok(())
    }
}

fn temp_image(sectors: u64) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
        .unwrap();
    f.flush().unwrap();
    f
}

fn direct_request(op: u8, id: u64, start: u64, gref: u32, first: u8, last: u8) -> RawRequest {
    let mut seg = [SegmentDescriptor {
        gref: U32::new(0),
        first_sect: 0,
        last_sect: 0,
        _pad: U16::new(0),
    }; BLKIF_MAX_SEGMENTS_PER_REQUEST];
    seg[0] = SegmentDescriptor {
        gref: U32::new(gref),
        first_sect: first,
        last_sect: last,
        _pad: U16::new(0),
    };
    let direct = RequestDirect {
        operation: op,
        nr_segments: 1,
        handle: U16::new(0),
        id: U64::new(id),
        sector_number: U64::new(start),
        seg,
    };
    let mut raw = RawRequest {
        bytes: [0u8; BLKIF_REQUEST_SIZE],
    };
    raw.bytes.copy_from_slice(unsafe {
        std::slice::from_raw_parts(&direct as *const _ as *const u8, BLKIF_REQUEST_SIZE)
    });
    raw
}

/// Push `raw` onto ring slot `slot` of a page laid out the way `Ring`
/// expects (64-byte header, 108-byte slots), and bump `req_prod`.
fn push_onto_ring(page: &mut [u8], slot: u32, raw: RawRequest) {
    let offset = 64 + slot as usize * BLKIF_REQUEST_SIZE;
    unsafe {
        std::ptr::write_unaligned(page.as_mut_ptr().add(offset) as *mut RawRequest, raw);
        let req_prod_ptr = page.as_mut_ptr() as *mut u32;
        let prev = std::ptr::read(req_prod_ptr);
        std::ptr::write(req_prod_ptr, prev + 1);
    }
}

#[test]
fn bind_drain_and_teardown_roundtrip() {
    let sup = Supervisor::new();
    let id = sup.admit().expect("first frontend admitted");

    let image = temp_image(4);
    let mut page = vec![0u8; PAGE_SIZE];

    let mut store = FakeStore::new();
    store
        .kv
        .insert("/local/domain/3/device/vbd/0/event-channel".into(), "9".into());
    store
        .kv
        .insert("/local/domain/3/device/vbd/0/ring-ref".into(), "10".into());
    store.kv.insert(
        "/local/domain/0/backend/vbd/3/0/params".into(),
        format!("'{}'", image.path().display()),
    );

    let mut grant_map = FakeGrantMap::new();
    grant_map.register(10, page.as_mut_ptr());

    let mut frontend = Frontend::bind(
        id,
        &mut store,
        "/local/domain/3/device/vbd/0",
        "/local/domain/0/backend/vbd/3/0",
        grant_map,
        |_port| Ok(FakeEventChannel::new()),
    )
    .unwrap();

    assert_eq!(
        store.kv.get("/local/domain/0/backend/vbd/3/0/feature-persistent"),
        Some(&"1".to_string())
    );
    assert_eq!(
        store.kv.get("/local/domain/0/backend/vbd/3/0/sectors"),
        Some(&"4".to_string())
    );

    push_onto_ring(&mut page, 0, direct_request(BLKIF_OP_WRITE, 1, 0, 1, 0, 0));
    let processed = frontend.drain();
    assert_eq!(processed, 1);
    assert_eq!(frontend.metrics().requests, 1);

    drop(frontend);
    sup.release();
    assert_eq!(sup.frontend_count(), 0);
}

#[test]
fn supervisor_refuses_past_the_cap() {
    let sup = Supervisor::new();
    for _ in 0..MAX_FRONTENDS {
        sup.admit().unwrap();
    }
    assert!(sup.admit().is_none());
    sup.release();
    assert!(sup.admit().is_some());
}

#[test]
fn two_frontends_share_no_state() {
    let image_a = temp_image(4);
    let image_b = temp_image(4);
    let mut page_a = vec![0u8; PAGE_SIZE];
    let mut page_b = vec![0u8; PAGE_SIZE];

    let mut store_a = FakeStore::new();
    store_a
        .kv
        .insert("/local/domain/1/device/vbd/0/event-channel".into(), "1".into());
    store_a
        .kv
        .insert("/local/domain/1/device/vbd/0/ring-ref".into(), "1".into());
    store_a.kv.insert(
        "/local/domain/0/backend/vbd/1/0/params".into(),
        image_a.path().display().to_string(),
    );

    let mut store_b = FakeStore::new();
    store_b
        .kv
        .insert("/local/domain/2/device/vbd/0/event-channel".into(), "2".into());
    store_b
        .kv
        .insert("/local/domain/2/device/vbd/0/ring-ref".into(), "2".into());
    store_b.kv.insert(
        "/local/domain/0/backend/vbd/2/0/params".into(),
        image_b.path().display().to_string(),
    );

    let mut grant_map_a = FakeGrantMap::new();
    grant_map_a.register(1, page_a.as_mut_ptr());
    let mut grant_map_b = FakeGrantMap::new();
    grant_map_b.register(2, page_b.as_mut_ptr());

    let mut fe_a = Frontend::bind(
        1,
        &mut store_a,
        "/local/domain/1/device/vbd/0",
        "/local/domain/0/backend/vbd/1/0",
        grant_map_a,
        |_port| Ok(FakeEventChannel::new()),
    )
    .unwrap();
    let mut fe_b = Frontend::bind(
        2,
        &mut store_b,
        "/local/domain/2/device/vbd/0",
        "/local/domain/0/backend/vbd/2/0",
        grant_map_b,
        |_port| Ok(FakeEventChannel::new()),
    )
    .unwrap();

    push_onto_ring(&mut page_a, 0, direct_request(BLKIF_OP_WRITE, 1, 0, 1, 0, 0));
    push_onto_ring(&mut page_b, 0, direct_request(BLKIF_OP_READ, 2, 0, 1, 0, 0));

    assert_eq!(fe_a.drain(), 1);
    assert_eq!(fe_b.drain(), 1);
    assert_eq!(fe_a.metrics().writes, 1);
    assert_eq!(fe_b.metrics().reads, 1);
}
