//! Block-device I/O primitives.
//!
//! All positional I/O goes through a 4K-aligned bounce buffer so that
//! transfers smaller than the physical block size still work on 4096-byte
//! sector drives: partial blocks are read-modified-written.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::MdError;
use crate::Result;

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
nix::ioctl_read_bad!(blksszget, nix::request_code_none!(0x12, 104), nix::libc::c_int);
nix::ioctl_none_bad!(blkflsbuf, nix::request_code_none!(0x12, 97));

pub const SECTOR_SIZE: u64 = 512;
const BOUNCE_SIZE: usize = 8192;

#[repr(align(4096))]
struct Bounce([u8; BOUNCE_SIZE]);

pub struct BlockDevice {
    file: File,
    path: PathBuf,
    block_size: u32,
    bounce: Box<Bounce>,
}

fn open_err(path: &Path, e: std::io::Error) -> MdError {
    let p = path.display().to_string();
    match e.kind() {
        std::io::ErrorKind::NotFound => MdError::NoDevice(p),
        std::io::ErrorKind::PermissionDenied => MdError::PermissionDenied(p),
        _ if e.raw_os_error() == Some(nix::libc::EBUSY) => MdError::Busy(p),
        _ => MdError::Io(e),
    }
}

impl BlockDevice {
    /// Open for shared read access.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, OpenOptions::new().read(true))
    }

    /// Open read-write. `O_EXCL` on a block device excludes other openers
    /// (mounts, other md members) without needing a lock file.
    pub fn open_excl(path: &Path) -> Result<Self> {
        Self::open_with(
            path,
            OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(nix::libc::O_EXCL),
        )
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        Self::open_with(path, OpenOptions::new().read(true).write(true))
    }

    fn open_with(path: &Path, opts: &OpenOptions) -> Result<Self> {
        let file = opts.open(path).map_err(|e| open_err(path, e))?;
        Ok(Self::from_file(file, path))
    }

    /// Wrap an already-open file. Regular files are accepted so tests can use
    /// sparse scratch files as devices.
    pub fn from_file(file: File, path: &Path) -> Self {
        let block_size = {
            let mut sz: nix::libc::c_int = 0;
            match unsafe { blksszget(file.as_raw_fd(), &mut sz) } {
                Ok(_) if sz > 0 && sz <= 4096 => sz as u32,
                _ => SECTOR_SIZE as u32,
            }
        };
        BlockDevice {
            file,
            path: path.to_path_buf(),
            block_size,
            bounce: Box::new(Bounce([0; BOUNCE_SIZE])),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Device size in bytes: `BLKGETSIZE64`, or the file length for regular
    /// files.
    pub fn size_bytes(&self) -> Result<u64> {
        let mut size: u64 = 0;
        if unsafe { blkgetsize64(self.file.as_raw_fd(), &mut size) }.is_ok() {
            return Ok(size);
        }
        let meta = self.file.metadata()?;
        if meta.file_type().is_file() {
            return Ok(meta.len());
        }
        Err(MdError::NoDevice(self.path.display().to_string()))
    }

    pub fn size_sectors(&self) -> Result<u64> {
        Ok(self.size_bytes()? / SECTOR_SIZE)
    }

    /// Drop the kernel's cached view so reads see current on-disk data.
    pub fn flush_cache(&self) {
        let _ = unsafe { blkflsbuf(self.file.as_raw_fd()) };
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size as u64;
        if offset % bs == 0 && buf.len() as u64 % bs == 0 {
            self.file.read_exact_at(buf, offset).map_err(MdError::Io)?;
            return Ok(());
        }
        let mut pos = 0usize;
        let mut dev_off = offset - offset % bs;
        let mut skip = (offset % bs) as usize;
        while pos < buf.len() {
            let want = (buf.len() - pos + skip + bs as usize - 1) / bs as usize * bs as usize;
            let chunk = want.min(BOUNCE_SIZE);
            self.file
                .read_exact_at(&mut self.bounce.0[..chunk], dev_off)?;
            let take = (chunk - skip).min(buf.len() - pos);
            buf[pos..pos + take].copy_from_slice(&self.bounce.0[skip..skip + take]);
            pos += take;
            dev_off += chunk as u64;
            skip = 0;
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let bs = self.block_size as u64;
        if offset % bs == 0 && buf.len() as u64 % bs == 0 {
            return self.write_all_counted(buf, offset);
        }
        // Sub-block write: read-modify-write the enclosing blocks.
        let start = offset - offset % bs;
        let end = (offset + buf.len() as u64 + bs - 1) / bs * bs;
        let mut dev_off = start;
        let mut pos = 0usize;
        while dev_off < end {
            let chunk = ((end - dev_off) as usize).min(BOUNCE_SIZE);
            // The leading and trailing blocks may be partially covered.
            if dev_off < offset || dev_off + chunk as u64 > offset + buf.len() as u64 {
                if self
                    .file
                    .read_exact_at(&mut self.bounce.0[..chunk], dev_off)
                    .is_err()
                {
                    self.bounce.0[..chunk].fill(0);
                }
            }
            let cs = offset.max(dev_off) - dev_off;
            let ce = (offset + buf.len() as u64).min(dev_off + chunk as u64) - dev_off;
            let take = (ce - cs) as usize;
            self.bounce.0[cs as usize..ce as usize].copy_from_slice(&buf[pos..pos + take]);
            let block = self.bounce.0[..chunk].to_vec();
            self.write_all_counted(&block, dev_off)?;
            pos += take;
            dev_off += chunk as u64;
        }
        Ok(())
    }

    fn write_all_counted(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(MdError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("short write: {} of {} bytes", done, buf.len()),
                    )))
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MdError::Io(e)),
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(MdError::Io)
    }
}

/// Check that `path` names a block device (tests may substitute regular
/// files; callers that require a real block device use this).
pub fn is_block_device(path: &Path) -> Result<bool> {
    let meta = std::fs::metadata(path).map_err(|e| open_err(path, e))?;
    Ok(meta.file_type().is_block_device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch(len: u64) -> (tempfile::NamedTempFile, BlockDevice) {
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file_mut().set_len(len).unwrap();
        tf.flush().unwrap();
        let dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        (tf, dev)
    }

    #[test]
    fn size_of_regular_file() {
        let (_tf, dev) = scratch(1 << 20);
        assert_eq!(dev.size_bytes().unwrap(), 1 << 20);
        assert_eq!(dev.size_sectors().unwrap(), 2048);
    }

    #[test]
    fn unaligned_roundtrip() {
        let (_tf, mut dev) = scratch(1 << 20);
        let data: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        dev.write_at(1000, &data).unwrap();
        let mut back = vec![0u8; 300];
        dev.read_at(1000, &mut back).unwrap();
        assert_eq!(back, data);
        // Neighbouring bytes untouched.
        let mut edge = vec![0u8; 8];
        dev.read_at(992, &mut edge).unwrap();
        assert_eq!(edge, [0; 8]);
    }

    #[test]
    fn sub_block_write_preserves_block() {
        let (_tf, mut dev) = scratch(1 << 16);
        dev.write_at(0, &[0xAA; 512]).unwrap();
        dev.write_at(100, &[0x55; 4]).unwrap();
        let mut blk = vec![0u8; 512];
        dev.read_at(0, &mut blk).unwrap();
        assert_eq!(&blk[..100], &[0xAA; 100][..]);
        assert_eq!(&blk[100..104], &[0x55; 4][..]);
        assert_eq!(&blk[104..], &[0xAA; 408][..]);
    }
}
