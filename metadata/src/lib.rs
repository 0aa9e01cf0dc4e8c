//! Superblock format drivers for the four metadata families: legacy v0.90,
//! versioned v1.x, and the two externally-managed container families DDF
//! and IMSM.
//!
//! Every driver implements the [`Metadata`] trait; callers that know the
//! family at compile time use the concrete types, discovery paths probe the
//! families in a fixed order through [`guess_metadata`].

pub mod backup;
pub mod bitmap;
pub mod checksum;
pub mod ddf;
pub mod endian;
pub mod imsm;
pub mod super0;
pub mod super1;

use std::any::Any;
use std::io::Write;
use std::path::PathBuf;

use mdctl_core::{BlockDevice, DiskInfo, MdError, MdInfo, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V090,
    V1,
    Ddf,
    Imsm,
}

/// Parameters for creating a fresh array.
#[derive(Debug, Clone, Default)]
pub struct CreateInfo {
    pub level: i32,
    pub raid_disks: i32,
    pub spare_disks: i32,
    pub layout: i32,
    /// bytes
    pub chunk_size: i32,
    /// component size in sectors; 0 means derive from the smallest device
    pub size_sectors: u64,
    pub name: String,
    pub homehost: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub md_minor: i32,
    pub clean: bool,
}

/// The closed set of named superblock mutations.
#[derive(Debug, Clone)]
pub enum Update {
    /// Shift the v0.90 tail up 4 bytes (2.2-era sparc alignment bug).
    Sparc22,
    SuperMinor,
    /// Recompute the disk-count summaries from the disks table.
    Summaries,
    /// Bump the event counter; force-clean RAID 4/5/6.
    Force,
    /// Clear the faulty bit for the recorded role at assemble time.
    Assemble,
    /// Install a new disk descriptor at a slot.
    NewDev,
    /// Widen raid_disks (linear only).
    Grow,
    /// Force the clean bit off so a resync happens.
    Resync,
    Uuid([u8; 16]),
    Name { name: String, homehost: Option<String> },
    HomeHost(String),
    /// Recompute data_size from the actual device size (v1.x only).
    DeviceSize(u64),
    /// Toggle the v0.90 big/little-endian store flag.
    ByteOrder,
    NoBitmap,
    WriteMostly,
    ReadWrite,
    ReshapeProgress(u64),
}

impl Update {
    /// Identity-only updates do not bump the event counter.
    pub fn is_identity(&self) -> bool {
        matches!(
            self,
            Update::Uuid(_)
                | Update::Name { .. }
                | Update::HomeHost(_)
                | Update::SuperMinor
                | Update::Sparc22
                | Update::ByteOrder
        )
    }
}

/// A physical member of an external-metadata container.
#[derive(Debug, Clone)]
pub struct ContainerMember {
    pub major: u32,
    pub minor: u32,
    pub path: PathBuf,
}

/// Opaque metadata update shipped from manager to monitor.
#[derive(Debug, Clone)]
pub struct MetaUpdate {
    pub kind: u32,
    pub buf: Vec<u8>,
}

/// Result of a successful spare activation: the slot assignment the caller
/// feeds back into the kernel.
#[derive(Debug, Clone)]
pub struct SpareAssign {
    pub disk: DiskInfo,
    /// sectors
    pub data_offset: u64,
    pub update: MetaUpdate,
}

#[derive(Debug, Clone, Default)]
pub struct BitmapParams {
    /// bytes; 0 = choose automatically
    pub chunk: u32,
    pub daemon_sleep: u32,
    pub write_behind: u32,
}

fn not_external<T>() -> Result<T> {
    Err(MdError::IncompatibleMetadata(
        "operation requires external metadata".into(),
    ))
}

/// The per-family capability set. Methods that only make sense for external
/// (container) metadata have failing defaults on the internal families.
pub trait Metadata: Any + Send {
    fn family(&self) -> Family;
    /// Short family name as used in map files: "0.90", "1.0".."1.2", "ddf", "imsm".
    fn name(&self) -> String;
    /// The `metadata_version` form: "1.2", "external:imsm", ...
    fn text_version(&self) -> String;
    fn is_external(&self) -> bool {
        false
    }
    fn loaded(&self) -> bool;
    fn as_any(&self) -> &dyn Any;

    /// Probe/load the superblock from a device. Errors for which
    /// [`MdError::is_probe_miss`] holds mean "not this family here".
    fn load(&mut self, dev: &mut BlockDevice) -> Result<()>;
    /// Release the loaded superblock and any subordinate state.
    fn free_super(&mut self);

    fn getinfo(&self) -> Result<MdInfo>;
    fn uuid(&self) -> Result<[u8; 16]>;
    fn match_home(&self, homehost: &str) -> Result<bool>;

    /// Compare against another loaded handler of the same family. With no
    /// reference loaded yet, adopts `other`'s superblock.
    fn compare(&mut self, other: &dyn Metadata) -> Result<()>;

    /// Apply a named mutation. Returns whether anything changed.
    fn update(&mut self, info: &mut MdInfo, update: &Update) -> Result<bool>;

    fn init(&mut self, info: &CreateInfo) -> Result<()>;
    fn add_to_super(&mut self, dk: &DiskInfo, dev: Option<BlockDevice>) -> Result<()>;
    fn remove_from_super(&mut self, dk: &DiskInfo) -> Result<()>;

    /// Write the loaded superblock to one device (checksum recomputed).
    fn store(&mut self, dev: &mut BlockDevice) -> Result<()>;
    /// Write a freshly initialised superblock to every pending device.
    fn write_init(&mut self) -> Result<()>;

    /// Usable data sectors on a device of the given size.
    fn avail_size(&self, dev_sectors: u64) -> u64;

    /// Returns the chosen bitmap chunk in bytes.
    fn add_internal_bitmap(&mut self, params: &BitmapParams, size_sectors: u64) -> Result<u32> {
        let _ = (params, size_sectors);
        Err(MdError::IncompatibleMetadata("no internal bitmap support".into()))
    }
    /// Byte offset of the bitmap superblock on a device of the given size.
    fn locate_bitmap(&self, dev_sectors: u64) -> Option<u64> {
        let _ = dev_sectors;
        None
    }
    fn write_bitmap(&mut self, dev: &mut BlockDevice) -> Result<()> {
        let _ = dev;
        Err(MdError::IncompatibleMetadata("no internal bitmap support".into()))
    }

    fn examine(&self, w: &mut dyn Write) -> Result<()>;
    fn brief_examine(&self, w: &mut dyn Write) -> Result<()>;
    fn export_examine(&self, w: &mut dyn Write) -> Result<()>;
    fn detail(&self, w: &mut dyn Write) -> Result<()>;
    fn brief_detail(&self, w: &mut dyn Write) -> Result<()>;

    /// (layout, chunk bytes) defaults for a level.
    fn default_geometry(&self, level: i32) -> (i32, i32) {
        match level {
            5 | 6 => (2, 512 * 1024),
            10 => (0x102, 512 * 1024),
            0 => (0, 512 * 1024),
            _ => (0, 0),
        }
    }

    // --- container / external-only capabilities ---

    fn load_container(&mut self, members: &[ContainerMember]) -> Result<()> {
        let _ = members;
        not_external()
    }
    fn container_content(&self) -> Result<Vec<MdInfo>> {
        not_external()
    }
    /// Attach to a subarray ("0", "1", ...) for monitoring; returns the
    /// volume index.
    fn open_subarray(&mut self, subarray: &str) -> Result<usize> {
        let _ = subarray;
        not_external()
    }
    fn set_array_state(&mut self, inst: usize, clean: bool, resync_start: u64) -> Result<()> {
        let _ = (inst, clean, resync_start);
        not_external()
    }
    fn set_disk(&mut self, inst: usize, slot: i32, state: u32) -> Result<()> {
        let _ = (inst, slot, state);
        not_external()
    }
    /// Persist dirty metadata to every container member; the anchor sector
    /// is always written last on each device.
    fn sync_metadata(&mut self) -> Result<()> {
        not_external()
    }
    fn process_update(&mut self, update: &MetaUpdate) -> Result<()> {
        let _ = update;
        not_external()
    }
    /// Pre-allocate whatever `process_update` will need, outside the
    /// monitor's hot path.
    fn prepare_update(&mut self, update: &MetaUpdate) -> Result<()> {
        let _ = update;
        Ok(())
    }
    fn activate_spare(&mut self, inst: usize) -> Result<Option<SpareAssign>> {
        let _ = inst;
        not_external()
    }
    fn min_acceptable_spare_size(&self) -> u64 {
        0
    }
}

/// Probe the families in fixed order.
pub fn guess_metadata(dev: &mut BlockDevice) -> Result<Box<dyn Metadata>> {
    let mut handlers: Vec<Box<dyn Metadata>> = vec![
        Box::new(super1::Super1::any_minor()),
        Box::new(super0::Super0::new()),
        Box::new(ddf::Ddf::new()),
        Box::new(imsm::Imsm::new()),
    ];
    for i in 0..handlers.len() {
        match handlers[i].load(dev) {
            Ok(()) => return Ok(handlers.swap_remove(i)),
            Err(e) if e.is_probe_miss() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(MdError::NoMagic)
}

/// Map a metadata name ("0.90", "1.2", "default", "ddf", "imsm",
/// "external:imsm", ...) to a fresh handler.
pub fn handler_for_name(arg: &str) -> Option<Box<dyn Metadata>> {
    let arg = arg.strip_prefix("external:").unwrap_or(arg);
    match arg {
        "0" | "0.90" | "00.90" => Some(Box::new(super0::Super0::new())),
        "default" | "1" | "1.x" => Some(Box::new(super1::Super1::any_minor())),
        "1.0" => Some(Box::new(super1::Super1::with_minor(0))),
        "1.1" => Some(Box::new(super1::Super1::with_minor(1))),
        "1.2" => Some(Box::new(super1::Super1::with_minor(2))),
        "ddf" => Some(Box::new(ddf::Ddf::new())),
        "imsm" => Some(Box::new(imsm::Imsm::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_names() {
        assert_eq!(handler_for_name("1.2").unwrap().name(), "1.2");
        assert_eq!(handler_for_name("0.90").unwrap().name(), "0.90");
        assert_eq!(handler_for_name("external:imsm").unwrap().name(), "imsm");
        assert!(handler_for_name("2.0").is_none());
    }

    #[test]
    fn identity_updates() {
        assert!(Update::Uuid([0; 16]).is_identity());
        assert!(!Update::Force.is_identity());
        assert!(!Update::Resync.is_identity());
    }
}
