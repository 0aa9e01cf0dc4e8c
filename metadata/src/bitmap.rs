//! The write-intent bitmap superblock: 256 bytes, little-endian, written in
//! the reserved space immediately after the array superblock (rounded up to
//! one sector).

use mdctl_core::{MdError, Result};
use static_assertions::const_assert_eq;

use crate::endian::{Le32, Le64, OnDisk};
use crate::BitmapParams;

pub const BITMAP_MAGIC: u32 = 0x6d74_6962; // "bitm"
/// On-disk footprint: the 256-byte record padded to a sector.
pub const BITMAP_SUPER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct RawBitmapSuper {
    magic: Le32,
    version: Le32,
    uuid: [u8; 16],
    events: Le64,
    events_cleared: Le64,
    sync_size: Le64,
    state: Le32,
    chunksize: Le32,
    daemon_sleep: Le32,
    write_behind: Le32,
    pad: [u8; 256 - 64],
}

const_assert_eq!(std::mem::size_of::<RawBitmapSuper>(), 256);
unsafe impl OnDisk for RawBitmapSuper {}

#[derive(Debug, Clone)]
pub struct BitmapSuper {
    pub version: u32,
    pub uuid: [u8; 16],
    pub events: u64,
    pub events_cleared: u64,
    /// sectors
    pub sync_size: u64,
    pub state: u32,
    /// bytes
    pub chunksize: u32,
    pub daemon_sleep: u32,
    pub write_behind: u32,
}

impl BitmapSuper {
    pub fn read_from(buf: &[u8]) -> Option<BitmapSuper> {
        let raw = RawBitmapSuper::read_from(buf)?;
        if raw.magic.get() != BITMAP_MAGIC {
            return None;
        }
        Some(BitmapSuper {
            version: raw.version.get(),
            uuid: raw.uuid,
            events: raw.events.get(),
            events_cleared: raw.events_cleared.get(),
            sync_size: raw.sync_size.get(),
            state: raw.state.get(),
            chunksize: raw.chunksize.get(),
            daemon_sleep: raw.daemon_sleep.get(),
            write_behind: raw.write_behind.get(),
        })
    }

    pub fn is_valid(&self) -> bool {
        (3..=4).contains(&self.version) && self.chunksize.is_power_of_two()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let raw = RawBitmapSuper {
            magic: Le32::new(BITMAP_MAGIC),
            version: Le32::new(self.version),
            uuid: self.uuid,
            events: Le64::new(self.events),
            events_cleared: Le64::new(self.events_cleared),
            sync_size: Le64::new(self.sync_size),
            state: Le32::new(self.state),
            chunksize: Le32::new(self.chunksize),
            daemon_sleep: Le32::new(self.daemon_sleep),
            write_behind: Le32::new(self.write_behind),
            pad: [0; 192],
        };
        let mut out = raw.as_bytes().to_vec();
        out.resize(BITMAP_SUPER_SIZE, 0);
        out
    }

    /// Number of bitmap bits for an array of `sync_size` sectors.
    pub fn bits(&self) -> u64 {
        let chunk = self.chunksize.max(1) as u64;
        (self.sync_size * 512 + chunk - 1) / chunk
    }
}

/// Choose a chunk and build the bitmap superblock.
///
/// With no chunk given, start at `default_chunk` and double until the bits
/// fit the reserved window.
pub fn create(
    params: &BitmapParams,
    size_sectors: u64,
    window_bytes: u64,
    uuid: [u8; 16],
    default_chunk: u32,
) -> Result<(BitmapSuper, u32)> {
    let window_bits = (window_bytes - BITMAP_SUPER_SIZE as u64) * 8;
    let fits = |chunk: u64| (size_sectors * 512 + chunk - 1) / chunk <= window_bits;
    let chunk = if params.chunk != 0 {
        if !params.chunk.is_power_of_two() {
            return Err(MdError::IncompatibleMetadata(format!(
                "bitmap chunk {} is not a power of two",
                params.chunk
            )));
        }
        if !fits(params.chunk as u64) {
            return Err(MdError::IncompatibleMetadata(format!(
                "bitmap chunk {} too small for reserved space",
                params.chunk
            )));
        }
        params.chunk
    } else {
        let mut chunk = 4096u64;
        while !fits(chunk) {
            chunk *= 2;
            if chunk > 1 << 62 {
                return Err(MdError::IncompatibleMetadata("array too large for bitmap".into()));
            }
        }
        chunk.max(default_chunk as u64) as u32
    };
    let bm = BitmapSuper {
        version: 4,
        uuid,
        events: 0,
        events_cleared: 0,
        sync_size: size_sectors,
        state: 0,
        chunksize: chunk,
        daemon_sleep: if params.daemon_sleep == 0 { 5 } else { params.daemon_sleep },
        write_behind: params.write_behind,
    };
    Ok((bm, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let (bm, chunk) = create(&BitmapParams::default(), 1 << 21, 60 * 1024, [3; 16], 4096)
            .unwrap();
        let bytes = bm.to_bytes();
        assert_eq!(bytes.len(), BITMAP_SUPER_SIZE);
        let back = BitmapSuper::read_from(&bytes).unwrap();
        assert!(back.is_valid());
        assert_eq!(back.chunksize, chunk);
        assert_eq!(back.uuid, [3; 16]);
        assert_eq!(back.sync_size, 1 << 21);
    }

    #[test]
    fn chunk_doubles_until_bits_fit() {
        // 1 TiB array, 60KiB window: 4096 chunks need 2^28 bits, far over
        // the ~489k available, so the chunk must grow
        let (bm, chunk) =
            create(&BitmapParams::default(), 1 << 31, 60 * 1024, [0; 16], 4096).unwrap();
        assert!(chunk > 4096);
        assert!(bm.bits() <= (60 * 1024 - BITMAP_SUPER_SIZE as u64) * 8);
    }

    #[test]
    fn explicit_chunk_rejected_when_too_small() {
        let err = create(
            &BitmapParams { chunk: 4096, ..Default::default() },
            1 << 31,
            60 * 1024,
            [0; 16],
            4096,
        );
        assert!(err.is_err());
    }

    #[test]
    fn large_default_chunk_wins_when_space_permits() {
        let (_bm, chunk) = create(
            &BitmapParams::default(),
            1 << 21,
            128 * 1024,
            [0; 16],
            64 * 1024 * 1024,
        )
        .unwrap();
        assert_eq!(chunk, 64 * 1024 * 1024);
    }
}
