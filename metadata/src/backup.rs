//! The critical-section backup record written during reshapes.
//!
//! A 512-byte block placed 4096 bytes before the backup data on every
//! destination (spare data area or backup file), and duplicated immediately
//! after the data. `-2` records carry a second window for the leap-frogging
//! same-size reshape.

use mdctl_core::util::check_env;
use mdctl_core::{BlockDevice, MdError, Result};
use static_assertions::const_assert_eq;

use crate::checksum::backup_csum;
use crate::endian::{Le32, Le64, OnDisk};

pub const BACKUP_MAGIC1: &[u8; 16] = b"md_backup_data-1";
pub const BACKUP_MAGIC2: &[u8; 16] = b"md_backup_data-2";

/// Acceptance window around the array update time.
pub const MTIME_SLACK_FUTURE: u64 = 2 * 60 * 60;
pub const MTIME_SLACK_PAST: u64 = 10 * 60;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BackupSuper {
    pub magic: [u8; 16],
    pub set_uuid: [u8; 16],
    pub mtime: Le64,
    /// address of the backup data on the destination, sectors
    pub devstart: Le64,
    /// region covered, in array-linear sectors
    pub arraystart: Le64,
    pub length: Le64,
    pub sb_csum: Le32,
    pub pad1: Le32,
    /// offset of the second window inside the backup data, sectors
    pub devstart2: Le64,
    pub arraystart2: Le64,
    pub length2: Le64,
    pub sb_csum2: Le32,
    pub pad: [u8; 512 - 68 - 32],
}

const_assert_eq!(std::mem::size_of::<BackupSuper>(), 512);
unsafe impl OnDisk for BackupSuper {}

const CSUM1_END: usize = 64; // prefix covered by sb_csum
const CSUM2_END: usize = 96; // prefix covered by sb_csum2

impl Default for BackupSuper {
    fn default() -> Self {
        let mut b: BackupSuper = unsafe { std::mem::zeroed() };
        b.magic = *BACKUP_MAGIC1;
        b
    }
}

impl BackupSuper {
    pub fn has_second_window(&self) -> bool {
        &self.magic == BACKUP_MAGIC2
    }

    pub fn enable_second_window(&mut self) {
        self.magic = *BACKUP_MAGIC2;
    }

    /// Recompute both checksums over the current contents.
    pub fn seal(&mut self) {
        let csum = backup_csum(&self.as_bytes()[..CSUM1_END]);
        self.sb_csum = Le32::new(csum);
        if self.has_second_window() {
            let csum2 = backup_csum(&self.as_bytes()[..CSUM2_END]);
            self.sb_csum2 = Le32::new(csum2);
        }
    }

    /// Both checksums verify and the magic is one of the known two.
    pub fn verify(&self) -> Result<()> {
        if &self.magic != BACKUP_MAGIC1 && &self.magic != BACKUP_MAGIC2 {
            return Err(MdError::NoMagic);
        }
        let computed = backup_csum(&self.as_bytes()[..CSUM1_END]);
        if computed != self.sb_csum.get() {
            return Err(MdError::BadChecksum { stored: self.sb_csum.get(), computed });
        }
        if self.has_second_window() {
            let computed = backup_csum(&self.as_bytes()[..CSUM2_END]);
            if computed != self.sb_csum2.get() {
                return Err(MdError::BadChecksum { stored: self.sb_csum2.get(), computed });
            }
        }
        Ok(())
    }

    /// The backup is only trusted when written near the array's own update
    /// time, unless `MDADM_GROW_ALLOW_OLD` overrides.
    pub fn check_mtime(&self, array_utime: u64) -> Result<()> {
        let mtime = self.mtime.get();
        if array_utime > mtime + MTIME_SLACK_FUTURE
            || array_utime + MTIME_SLACK_PAST < mtime
        {
            if check_env("MDADM_GROW_ALLOW_OLD") {
                log::warn!(
                    "accepting backup with timestamp {} for array with timestamp {}",
                    mtime,
                    array_utime
                );
            } else {
                return Err(MdError::BackupStale { mtime, utime: array_utime });
            }
        }
        Ok(())
    }

    /// Write the record before (`data_offset - 4096`) and, when there is
    /// room, after the backup data.
    pub fn write_around(
        &self,
        dev: &mut BlockDevice,
        data_offset_bytes: u64,
        data_len_bytes: u64,
    ) -> Result<()> {
        if data_offset_bytes < 4096 {
            return Err(MdError::IncompatibleMetadata(
                "backup destination leaves no room for its header".into(),
            ));
        }
        dev.write_at(data_offset_bytes - 4096, self.as_bytes())?;
        if data_offset_bytes > 4096 {
            dev.write_at(data_offset_bytes + data_len_bytes, self.as_bytes())?;
        }
        dev.sync()
    }

    /// Read the record found at `offset_bytes`.
    pub fn read_at(dev: &mut BlockDevice, offset_bytes: u64) -> Result<BackupSuper> {
        let mut buf = [0u8; 512];
        dev.read_at(offset_bytes, &mut buf)?;
        BackupSuper::read_from(&buf).ok_or(MdError::NoMagic)
    }

    /// Bytes compared between the leading and trailing copy: through the
    /// first checksum for `-1` records, through the second for `-2`.
    pub fn compare_len(&self) -> usize {
        if self.has_second_window() {
            CSUM2_END + 4
        } else {
            CSUM1_END + 4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_verify() {
        let mut b = BackupSuper::default();
        b.set_uuid = [3; 16];
        b.mtime = Le64::new(1234);
        b.devstart = Le64::new(100);
        b.arraystart = Le64::new(0);
        b.length = Le64::new(384);
        b.seal();
        b.verify().unwrap();

        // any bit flip in the covered prefix breaks it
        b.devstart = Le64::new(101);
        assert!(matches!(b.verify(), Err(MdError::BadChecksum { .. })));
    }

    #[test]
    fn second_window_has_own_checksum() {
        let mut b = BackupSuper::default();
        b.enable_second_window();
        b.length = Le64::new(64);
        b.arraystart2 = Le64::new(512);
        b.length2 = Le64::new(64);
        b.seal();
        b.verify().unwrap();
        b.arraystart2 = Le64::new(513);
        assert!(b.verify().is_err());
    }

    #[test]
    fn mtime_window() {
        let mut b = BackupSuper::default();
        b.mtime = Le64::new(10_000);
        b.seal();
        // within the window
        b.check_mtime(10_000 + MTIME_SLACK_FUTURE).unwrap();
        b.check_mtime(10_000 - MTIME_SLACK_PAST).unwrap();
        // array updated long after the backup
        assert!(matches!(
            b.check_mtime(10_000 + MTIME_SLACK_FUTURE + 1),
            Err(MdError::BackupStale { .. })
        ));
    }

    #[test]
    fn round_trip_around_data() {
        let tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file().set_len(1 << 20).unwrap();
        let mut dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        let mut b = BackupSuper::default();
        b.devstart = Le64::new(16);
        b.length = Le64::new(8);
        b.seal();
        b.write_around(&mut dev, 16 * 512, 8 * 512).unwrap();
        let lead = BackupSuper::read_at(&mut dev, 16 * 512 - 4096).unwrap();
        let tail = BackupSuper::read_at(&mut dev, 16 * 512 + 8 * 512).unwrap();
        lead.verify().unwrap();
        assert_eq!(
            &lead.as_bytes()[..lead.compare_len()],
            &tail.as_bytes()[..tail.compare_len()]
        );
    }
}
