//! Memory-mapped view over the backing file for one frontend's disk image.
//!
//! Grounded in `perunner::iofile::IoFile`: a single `memmap2::MmapMut` over a
//! file opened once at construction, with sector-aligned bounds checks done
//! up front so the hot read/write path never touches the filesystem layer
//! again.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::wire::SECTOR_SIZE;

/// Largest sector count this store will accept: sector indices must fit in
/// a signed 31-bit range to guard against overflow further down the pipeline.
const MAX_SECTOR_COUNT: u64 = i32::MAX as u64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("opening image file: {0}")]
    Open(#[source] std::io::Error),
    #[error("mapping image file: {0}")]
    Map(#[source] std::io::Error),
    #[error("image size {size} is zero")]
    EmptyImage { size: u64 },
    #[error("image size {size} is not a multiple of sector size {sector_size}")]
    UnalignedImage { size: u64, sector_size: u64 },
    #[error("image has {sectors} sectors, exceeding the addressable limit of {max}")]
    ImageTooLarge { sectors: u64, max: u64 },
    #[error("range [{start}, {start}+{count}) is out of range for a {sector_count}-sector image")]
    OutOfRange {
        start: u64,
        count: u64,
        sector_count: u64,
    },
    #[error("flushing image: {0}")]
    Flush(#[source] std::io::Error),
}

/// A raw-sectors, no-header disk image: `size / 512` fixed-size sectors,
/// memory-mapped read/write shared for the lifetime of the store.
pub struct ImageStore {
    mmap: MmapMut,
    sector_count: u64,
}

impl ImageStore {
    pub fn open(path: &Path) -> Result<ImageStore, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Open)?;
        let meta = file.metadata().map_err(Error::Open)?;
        let size = meta.len();

        if size == 0 {
            return Err(Error::EmptyImage { size });
        }
        if size % SECTOR_SIZE != 0 {
            return Err(Error::UnalignedImage {
                size,
                sector_size: SECTOR_SIZE,
            });
        }
        let sector_count = size / SECTOR_SIZE;
        if sector_count > MAX_SECTOR_COUNT {
            return Err(Error::ImageTooLarge {
                sectors: sector_count,
                max: MAX_SECTOR_COUNT,
            });
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(Error::Map)? };

        Ok(ImageStore { mmap, sector_count })
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn check_range(&self, start: u64, nr_sectors: u64) -> Result<(), Error> {
        // last_sector = start + nr_sectors - 1; a range ending exactly at
        // sector_count is in bounds, one starting there is not.
        if nr_sectors == 0 || start + nr_sectors > self.sector_count {
            return Err(Error::OutOfRange {
                start,
                count: nr_sectors,
                sector_count: self.sector_count,
            });
        }
        Ok(())
    }

    fn byte_range(&self, start: u64, nr_sectors: u64) -> (usize, usize) {
        let begin = (start * SECTOR_SIZE) as usize;
        let end = begin + (nr_sectors * SECTOR_SIZE) as usize;
        (begin, end)
    }

    pub fn read(&self, start: u64, nr_sectors: u64, out: &mut [u8]) -> Result<(), Error> {
        self.check_range(start, nr_sectors)?;
        let (begin, end) = self.byte_range(start, nr_sectors);
        out[..end - begin].copy_from_slice(&self.mmap[begin..end]);
        Ok(())
    }

    pub fn write(&mut self, start: u64, nr_sectors: u64, data: &[u8]) -> Result<(), Error> {
        self.check_range(start, nr_sectors)?;
        let (begin, end) = self.byte_range(start, nr_sectors);
        self.mmap[begin..end].copy_from_slice(&data[..end - begin]);
        Ok(())
    }

    pub fn discard(&mut self, start: u64, nr_sectors: u64) -> Result<(), Error> {
        self.check_range(start, nr_sectors)?;
        let (begin, end) = self.byte_range(start, nr_sectors);
        self.mmap[begin..end].fill(0);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.mmap.flush().map_err(Error::Flush)
    }
}

impl Drop for ImageStore {
    fn drop(&mut self) {
        if let Err(e) = self.mmap.flush() {
            log::warn!("image flush on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn image_of(sectors: u64) -> (tempfile::NamedTempFile, ImageStore) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (sectors * SECTOR_SIZE) as usize])
            .unwrap();
        f.flush().unwrap();
        let store = ImageStore::open(f.path()).unwrap();
        (f, store)
    }

    #[test]
    fn rejects_empty_and_unaligned_and_oversized() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            ImageStore::open(f.path()),
            Err(Error::EmptyImage { .. })
        ));

        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        f2.write_all(&[0u8; 100]).unwrap();
        f2.flush().unwrap();
        assert!(matches!(
            ImageStore::open(f2.path()),
            Err(Error::UnalignedImage { .. })
        ));
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (_f, mut store) = image_of(4);
        let payload = vec![0xAAu8; SECTOR_SIZE as usize];
        store.write(0, 1, &payload).unwrap();

        let mut out = vec![0u8; SECTOR_SIZE as usize];
        store.read(0, 1, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn discard_zeroes_the_range() {
        let (_f, mut store) = image_of(4);
        store.write(0, 1, &vec![0xAAu8; SECTOR_SIZE as usize]).unwrap();
        store.discard(0, 1).unwrap();

        let mut out = vec![0xFFu8; SECTOR_SIZE as usize];
        store.read(0, 1, &mut out).unwrap();
        assert_eq!(out, vec![0u8; SECTOR_SIZE as usize]);
    }

    #[test]
    fn range_ending_exactly_at_sector_count_succeeds_starting_there_fails() {
        let (_f, store) = image_of(4);
        let mut out = vec![0u8; SECTOR_SIZE as usize];
        assert!(store.read(3, 1, &mut out).is_ok());
        assert!(matches!(
            store.read(4, 1, &mut out),
            Err(Error::OutOfRange { .. })
        ));
    }
}
