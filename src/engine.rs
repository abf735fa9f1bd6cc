//! Decodes each ring request, resolves segment grants via the Grant Cache,
//! performs the sector-range I/O through the Image Store, and composes the
//! response record. Errors never escape this module: every per-request
//! failure is encoded into the response and the loop continues.

use crate::gnttab::GrantMap;
use crate::grant_cache::GrantCache;
use crate::image::ImageStore;
use crate::validator;
use crate::wire::{
    Request, RequestDirect, RequestIndirect, Response, SegmentDescriptor, BLKIF_OP_READ,
    BLKIF_OP_WRITE, BLKIF_RSP_EOPNOTSUPP, BLKIF_RSP_ERROR, BLKIF_RSP_OKAY, PAGE_SIZE,
    SECTORS_PER_PAGE, SECTOR_SIZE, SEGMENTS_PER_INDIRECT_PAGE,
};

/// Processes requests for exactly one frontend: owns the Grant Cache and the
/// Image Store, both accessed only from this single serial worker (§5).
pub struct Engine<M: GrantMap> {
    cache: GrantCache<M>,
    image: ImageStore,
}

impl<M: GrantMap> Engine<M> {
    pub fn new(cache: GrantCache<M>, image: ImageStore) -> Engine<M> {
        Engine { cache, image }
    }

    pub fn image(&self) -> &ImageStore {
        &self.image
    }

    pub fn cache_mut(&mut self) -> &mut GrantCache<M> {
        &mut self.cache
    }

    /// Process one decoded request, returning the response to post on the
    /// ring. Never fails; every error path becomes an `ERROR`/`EOPNOTSUPP`
    /// response.
    pub fn process(&mut self, req: Request<'_>, id: u64) -> Response {
        match req {
            Request::Read(d) => self.direct(d, BLKIF_OP_READ, id),
            Request::Write(d) => self.direct(d, BLKIF_OP_WRITE, id),
            Request::WriteBarrier => self.flush(crate::wire::BLKIF_OP_WRITE_BARRIER, id),
            Request::FlushDiskCache => self.flush(crate::wire::BLKIF_OP_FLUSH_DISKCACHE, id),
            Request::Discard(d) => self.discard(d, id),
            Request::Indirect(d) => self.indirect(d, id),
            Request::Unknown(op) => Response::new(id, op, BLKIF_RSP_EOPNOTSUPP),
        }
    }

    fn direct(&mut self, req: &RequestDirect, op: u8, id: u64) -> Response {
        if let Err(e) = validator::validate_direct(req) {
            log::debug!("direct request rejected: {e}");
            return Response::new(id, op, BLKIF_RSP_ERROR);
        }

        let n = req.nr_segments as usize;
        let mut cursor = req.sector_number.get();
        for seg in &req.seg[..n] {
            match self.transfer_segment(seg, op, cursor) {
                Ok(nr_sectors) => cursor += nr_sectors,
                Err(()) => return Response::new(id, op, BLKIF_RSP_ERROR),
            }
        }
        Response::new(id, op, BLKIF_RSP_OKAY)
    }

    /// Resolve one segment's grant, compute its data area, and perform the
    /// sector I/O at `cursor`. Returns the number of sectors transferred so
    /// the caller can advance its contiguous cursor.
    fn transfer_segment(&mut self, seg: &SegmentDescriptor, op: u8, cursor: u64) -> Result<u64, ()> {
        let page = self.cache.get_or_map(seg.gref.get()).map_err(|e| {
            log::debug!("grant map failed: {e}");
        })?;
        let nr_sectors = seg.nr_sectors().ok_or(())?;
        let data_off = seg.first_sect as usize * SECTOR_SIZE as usize;
        let data_len = nr_sectors as usize * SECTOR_SIZE as usize;

        let data = unsafe { std::slice::from_raw_parts_mut(page.add(data_off), data_len) };
        match op {
            BLKIF_OP_READ => self.image.read(cursor, nr_sectors, data).map_err(|e| {
                log::debug!("image read failed: {e}");
            })?,
            BLKIF_OP_WRITE => self.image.write(cursor, nr_sectors, data).map_err(|e| {
                log::debug!("image write failed: {e}");
            })?,
            _ => unreachable!("transfer_segment only called for READ/WRITE"),
        }
        Ok(nr_sectors)
    }

    fn flush(&mut self, op: u8, id: u64) -> Response {
        match self.image.flush() {
            Ok(()) => Response::new(id, op, BLKIF_RSP_OKAY),
            Err(e) => {
                log::warn!("flush failed: {e}");
                Response::new(id, op, BLKIF_RSP_ERROR)
            }
        }
    }

    fn discard(&mut self, req: &crate::wire::RequestDiscard, id: u64) -> Response {
        let op = crate::wire::BLKIF_OP_DISCARD;
        match self
            .image
            .discard(req.sector_number.get(), req.nr_sectors.get())
        {
            Ok(()) => Response::new(id, op, BLKIF_RSP_OKAY),
            Err(e) => {
                log::debug!("discard failed: {e}");
                Response::new(id, op, BLKIF_RSP_ERROR)
            }
        }
    }

    fn indirect(&mut self, req: &RequestIndirect, id: u64) -> Response {
        if let Err(e) = validator::validate_indirect(req) {
            log::debug!("indirect request rejected: {e}");
            return Response::new(id, crate::wire::BLKIF_OP_INDIRECT, BLKIF_RSP_ERROR);
        }

        let op = req.indirect_op;
        let total = req.nr_segments.get() as usize;
        let pages = total.div_ceil(SEGMENTS_PER_INDIRECT_PAGE);
        let mut cursor = req.sector_number.get();
        let mut remaining = total;

        for &gref in &req.indirect_grefs[..pages] {
            let take = remaining.min(SEGMENTS_PER_INDIRECT_PAGE);
            let page = match self.cache.get_or_map(gref.get()) {
                Ok(p) => p,
                Err(e) => {
                    log::debug!("indirect page map failed: {e}");
                    return Response::new(id, op, BLKIF_RSP_ERROR);
                }
            };
            let descriptors = unsafe {
                std::slice::from_raw_parts(page as *const SegmentDescriptor, SEGMENTS_PER_INDIRECT_PAGE)
            };

            for seg in &descriptors[..take] {
                if !seg.is_valid() {
                    log::debug!("indirect segment invalid: {seg:?}");
                    return Response::new(id, op, BLKIF_RSP_ERROR);
                }
                match self.transfer_segment(seg, op, cursor) {
                    Ok(nr_sectors) => cursor += nr_sectors,
                    Err(()) => return Response::new(id, op, BLKIF_RSP_ERROR),
                }
            }
            remaining -= take;
        }

        Response::new(id, op, BLKIF_RSP_OKAY)
    }
}

const _: () = assert!(PAGE_SIZE as u64 == SECTORS_PER_PAGE * SECTOR_SIZE);
