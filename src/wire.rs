//! Wire-fixed structures for the block-interface ABI (`blkif_request_t`,
//! `blkif_response_t` and friends). Bit-exact layout, no custom encoding:
//! every multi-byte field uses a `zerocopy` byte-order wrapper (alignment 1)
//! so `#[repr(C)]` never inserts hidden compiler padding, the same trick
//! `peerofs::disk` uses for its on-disk structures.

use zerocopy::byteorder::little_endian::{I16, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Sector size is fixed at 512 bytes for this ABI.
pub const SECTOR_SIZE: u64 = 512;
/// Sectors addressable within a single 4096-byte guest page.
pub const SECTORS_PER_PAGE: u64 = 8;
/// Page size assumed for ring sizing and indirect segment pages.
pub const PAGE_SIZE: usize = 4096;

/// Direct (non-indirect) requests carry at most this many segments inline.
pub const BLKIF_MAX_SEGMENTS_PER_REQUEST: usize = 11;
/// Indirect requests reference at most this many pages of segment descriptors.
pub const BLKIF_MAX_INDIRECT_PAGES_PER_REQUEST: usize = 8;
/// Largest `nr_segments` an indirect request may carry.
pub const BLKIF_MAX_INDIRECT_SEGMENTS: u32 = 256;

/// Segment descriptors per indirect page: `page_size / sizeof(segment)`.
pub const SEGMENTS_PER_INDIRECT_PAGE: usize = PAGE_SIZE / SegmentDescriptor::SIZE;

/// Fixed size, in bytes, of one request record (direct/discard/indirect
/// variants are all padded out to this size, like the real ABI's union).
pub const BLKIF_REQUEST_SIZE: usize = 108;

pub const BLKIF_OP_READ: u8 = 0;
pub const BLKIF_OP_WRITE: u8 = 1;
pub const BLKIF_OP_WRITE_BARRIER: u8 = 2;
pub const BLKIF_OP_FLUSH_DISKCACHE: u8 = 3;
pub const BLKIF_OP_DISCARD: u8 = 5;
pub const BLKIF_OP_INDIRECT: u8 = 6;

pub const BLKIF_RSP_OKAY: i16 = 0;
pub const BLKIF_RSP_ERROR: i16 = -5;
pub const BLKIF_RSP_EOPNOTSUPP: i16 = -95;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentDescriptor {
    pub gref: U32,
    pub first_sect: u8,
    pub last_sect: u8,
    pub _pad: U16,
}

impl SegmentDescriptor {
    pub const SIZE: usize = 8;

    pub fn nr_sectors(&self) -> Option<u64> {
        if self.first_sect > self.last_sect {
            return None;
        }
        Some((self.last_sect - self.first_sect + 1) as u64)
    }

    /// `gref != 0 && first_sect <= last_sect < SECTORS_PER_PAGE`.
    pub fn is_valid(&self) -> bool {
        self.gref.get() != 0
            && self.first_sect <= self.last_sect
            && (self.last_sect as u64) < SECTORS_PER_PAGE
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RequestDirect {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: U16,
    pub id: U64,
    pub sector_number: U64,
    pub seg: [SegmentDescriptor; BLKIF_MAX_SEGMENTS_PER_REQUEST],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RequestDiscard {
    pub operation: u8,
    pub flag: u8,
    pub handle: U16,
    pub id: U64,
    pub sector_number: U64,
    pub nr_sectors: U64,
    pub _pad: [u8; BLKIF_REQUEST_SIZE - 28],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RequestIndirect {
    pub operation: u8,
    pub indirect_op: u8,
    pub nr_segments: U16,
    pub _pad1: U32,
    pub id: U64,
    pub sector_number: U64,
    pub handle: U16,
    pub _pad2: U16,
    pub indirect_grefs: [U32; BLKIF_MAX_INDIRECT_PAGES_PER_REQUEST],
    pub _pad3: [u8; BLKIF_REQUEST_SIZE - 60],
}

const _: () = assert!(std::mem::size_of::<RequestDirect>() == BLKIF_REQUEST_SIZE);
const _: () = assert!(std::mem::size_of::<RequestDiscard>() == BLKIF_REQUEST_SIZE);
const _: () = assert!(std::mem::size_of::<RequestIndirect>() == BLKIF_REQUEST_SIZE);

/// A raw ring slot, reinterpreted as whichever variant `operation` selects.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawRequest {
    pub bytes: [u8; BLKIF_REQUEST_SIZE],
}

impl RawRequest {
    pub fn operation(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_direct(&self) -> &RequestDirect {
        RequestDirect::ref_from_bytes(&self.bytes).expect("fixed-size, infallible")
    }

    pub fn as_discard(&self) -> &RequestDiscard {
        RequestDiscard::ref_from_bytes(&self.bytes).expect("fixed-size, infallible")
    }

    pub fn as_indirect(&self) -> &RequestIndirect {
        RequestIndirect::ref_from_bytes(&self.bytes).expect("fixed-size, infallible")
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Response {
    pub id: U64,
    pub operation: u8,
    pub _pad: u8,
    pub status: I16,
}

pub const BLKIF_RESPONSE_SIZE: usize = std::mem::size_of::<Response>();

impl Response {
    pub fn new(id: u64, operation: u8, status: i16) -> Self {
        Response {
            id: U64::new(id),
            operation,
            _pad: 0,
            status: I16::new(status),
        }
    }
}

/// Request operation, decoded enough for dispatch; the payload variants stay
/// as references into the raw ring slot to avoid copying segment arrays.
#[derive(Debug)]
pub enum Request<'a> {
    Read(&'a RequestDirect),
    Write(&'a RequestDirect),
    WriteBarrier,
    FlushDiskCache,
    Discard(&'a RequestDiscard),
    Indirect(&'a RequestIndirect),
    Unknown(u8),
}

impl<'a> Request<'a> {
    pub fn decode(raw: &'a RawRequest) -> Request<'a> {
        match raw.operation() {
            BLKIF_OP_READ => Request::Read(raw.as_direct()),
            BLKIF_OP_WRITE => Request::Write(raw.as_direct()),
            BLKIF_OP_WRITE_BARRIER => Request::WriteBarrier,
            BLKIF_OP_FLUSH_DISKCACHE => Request::FlushDiskCache,
            BLKIF_OP_DISCARD => Request::Discard(raw.as_discard()),
            BLKIF_OP_INDIRECT => Request::Indirect(raw.as_indirect()),
            op => Request::Unknown(op),
        }
    }

    /// The request id, echoed into the response (same offset in every
    /// variant of the real ABI's union).
    pub fn id(&self, raw: &RawRequest) -> u64 {
        match self {
            Request::Read(d) | Request::Write(d) => d.id.get(),
            Request::Discard(d) => d.id.get(),
            Request::Indirect(d) => d.id.get(),
            Request::WriteBarrier | Request::FlushDiskCache | Request::Unknown(_) => {
                RequestDirect::ref_from_bytes(&raw.bytes)
                    .expect("fixed-size, infallible")
                    .id
                    .get()
            }
        }
    }
}
