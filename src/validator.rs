//! Screens requests against wire-level invariants before any grant mapping
//! or image I/O happens.

use crate::wire::{
    RequestDirect, RequestIndirect, BLKIF_MAX_INDIRECT_SEGMENTS, BLKIF_MAX_SEGMENTS_PER_REQUEST,
    BLKIF_OP_READ, BLKIF_OP_WRITE,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("nr_segments {0} is zero")]
    NoSegments(u8),
    #[error("nr_segments {0} exceeds the direct-request limit of {1}")]
    TooManyDirectSegments(u8, usize),
    #[error("nr_segments {0} exceeds the indirect-request limit of {1}")]
    TooManyIndirectSegments(u32, u32),
    #[error("indirect nr_segments is zero")]
    NoIndirectSegments,
    #[error("indirect_op {0} is neither READ nor WRITE")]
    BadIndirectOp(u8),
    #[error("segment {index} has first_sect {first} > last_sect {last}, or out of page range")]
    BadSegment { index: usize, first: u8, last: u8 },
}

/// Validate a direct READ/WRITE request: `1 <= nr_segments <= 11`, and every
/// segment descriptor individually valid.
pub fn validate_direct(req: &RequestDirect) -> Result<(), Error> {
    let n = req.nr_segments;
    if n == 0 {
        return Err(Error::NoSegments(n));
    }
    if n as usize > BLKIF_MAX_SEGMENTS_PER_REQUEST {
        return Err(Error::TooManyDirectSegments(n, BLKIF_MAX_SEGMENTS_PER_REQUEST));
    }
    for (i, seg) in req.seg[..n as usize].iter().enumerate() {
        if !seg.is_valid() {
            return Err(Error::BadSegment {
                index: i,
                first: seg.first_sect,
                last: seg.last_sect,
            });
        }
    }
    Ok(())
}

/// Validate an indirect request's header (the segment descriptors inside the
/// referenced pages are validated individually as they're read, reusing the
/// same per-segment check).
pub fn validate_indirect(req: &RequestIndirect) -> Result<(), Error> {
    let op = req.indirect_op;
    if op != BLKIF_OP_READ && op != BLKIF_OP_WRITE {
        return Err(Error::BadIndirectOp(op));
    }
    let n = req.nr_segments.get() as u32;
    if n == 0 {
        return Err(Error::NoIndirectSegments);
    }
    if n > BLKIF_MAX_INDIRECT_SEGMENTS {
        return Err(Error::TooManyIndirectSegments(n, BLKIF_MAX_INDIRECT_SEGMENTS));
    }
    Ok(())
}
