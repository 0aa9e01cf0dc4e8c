//! SNIA DDF container metadata. Everything on disk is big-endian.
//!
//! The authoritative locator is the anchor header in the last sector of each
//! member; it points at primary/secondary header copies, the controller
//! record, the phys/virt tables and the per-disk config records. Every
//! section checksum is a CRC32 computed with the crc field preset to
//! 0xFFFFFFFF, and on store the anchor is always the last sector written so
//! a crash mid-sync leaves the old generation reachable.

use std::any::Any;
use std::io::Write;

use mdctl_core::model::{dev_state, level};
use mdctl_core::{BlockDevice, DiskInfo, MdError, MdInfo, Result};
use sha1::{Digest, Sha1};
use static_assertions::const_assert_eq;

use crate::checksum::ddf_crc;
use crate::endian::{Be16, Be32, Be64, OnDisk};
use crate::super0::now_secs;
use crate::{ContainerMember, CreateInfo, Family, MetaUpdate, Metadata, SpareAssign, Update};

pub const DDF_HEADER_MAGIC: u32 = 0xDE11DE11;
pub const DDF_CONTROLLER_MAGIC: u32 = 0xAD111111;
pub const DDF_PHYS_RECORDS_MAGIC: u32 = 0x22222222;
pub const DDF_VIRT_RECORDS_MAGIC: u32 = 0xDDDDDDDD;
pub const DDF_VD_CONF_MAGIC: u32 = 0xEEEEEEEE;

pub const DDF_GUID_LEN: usize = 24;

// phys_disk_entry.type bits
pub const DDF_ACTIVE_IN_VD: u16 = 2;
pub const DDF_GLOBAL_SPARE: u16 = 4;
pub const DDF_SPARE: u16 = 8;

// phys_disk_entry.state bits
pub const DDF_ONLINE: u16 = 1;
pub const DDF_FAILED: u16 = 2;
pub const DDF_REBUILDING: u16 = 4;
pub const DDF_MISSING: u16 = 64;

// virtual_entry.state
pub const DDF_STATE_MASK: u8 = 0x7;
pub const DDF_STATE_OPTIMAL: u8 = 0x0;
pub const DDF_STATE_DEGRADED: u8 = 0x1;
pub const DDF_STATE_FAILED: u8 = 0x4;

const HEADER_ANCHOR: u8 = 0x00;
const HEADER_PRIMARY: u8 = 0x01;
const HEADER_SECONDARY: u8 = 0x02;

const WORKSPACE_SECTORS: u64 = 32768;
const MAX_PD_ENTRIES: usize = 63;
const MAX_VD_ENTRIES: usize = 15;
const MPPE: usize = 64; // max primary element entries
const CONFIG_RECORD_LEN: u16 = 1 + ((MPPE * 12 + 511) / 512) as u16;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DdfHeader {
    pub magic: Be32,
    pub crc: Be32,
    pub guid: [u8; DDF_GUID_LEN],
    pub revision: [u8; 8],
    pub seq: Be32,
    pub timestamp: Be32,
    pub openflag: u8,
    pub foreignflag: u8,
    pub enforcegroups: u8,
    pub pad0: u8,
    pub pad1: [u8; 12],
    pub header_ext: [u8; 32],
    pub primary_lba: Be64,
    pub secondary_lba: Be64,
    pub htype: u8,
    pub pad2: [u8; 3],
    pub workspace_len: Be32,
    pub workspace_lba: Be64,
    pub max_pd_entries: Be16,
    pub max_vd_entries: Be16,
    pub max_partitions: Be16,
    pub config_record_len: Be16,
    pub max_primary_element_entries: Be16,
    pub pad3: [u8; 54],
    pub controller_section_offset: Be32,
    pub controller_section_length: Be32,
    pub phys_section_offset: Be32,
    pub phys_section_length: Be32,
    pub virt_section_offset: Be32,
    pub virt_section_length: Be32,
    pub config_section_offset: Be32,
    pub config_section_length: Be32,
    pub data_section_offset: Be32,
    pub data_section_length: Be32,
    pub bbm_section_offset: Be32,
    pub bbm_section_length: Be32,
    pub diag_space_offset: Be32,
    pub diag_space_length: Be32,
    pub vendor_offset: Be32,
    pub vendor_length: Be32,
    pub pad4: [u8; 256],
}

const_assert_eq!(std::mem::size_of::<DdfHeader>(), 512);
unsafe impl OnDisk for DdfHeader {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DdfController {
    pub magic: Be32,
    pub crc: Be32,
    pub guid: [u8; DDF_GUID_LEN],
    pub vendor_id: Be16,
    pub device_id: Be16,
    pub sub_vendor_id: Be16,
    pub sub_device_id: Be16,
    pub product_id: [u8; 16],
    pub pad: [u8; 8],
    pub vendor_data: [u8; 448],
}

const_assert_eq!(std::mem::size_of::<DdfController>(), 512);
unsafe impl OnDisk for DdfController {}

/// Common head of the phys- and virt-disk tables.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TableHeader {
    pub magic: Be32,
    pub crc: Be32,
    pub populated: Be16,
    pub max: Be16,
    pub pad: [u8; 52],
}

const_assert_eq!(std::mem::size_of::<TableHeader>(), 64);
unsafe impl OnDisk for TableHeader {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PhysEntry {
    pub guid: [u8; DDF_GUID_LEN],
    pub refnum: Be32,
    pub ptype: Be16,
    pub state: Be16,
    pub config_size: Be64,
    pub path: [u8; 18],
    pub pad: [u8; 6],
}

const_assert_eq!(std::mem::size_of::<PhysEntry>(), 64);
unsafe impl OnDisk for PhysEntry {}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VirtEntry {
    pub guid: [u8; DDF_GUID_LEN],
    pub unit: Be16,
    pub pad0: Be16,
    pub guid_crc: Be16,
    pub vtype: Be16,
    pub state: u8,
    pub init_state: u8,
    pub pad1: [u8; 14],
    pub name: [u8; 16],
}

const_assert_eq!(std::mem::size_of::<VirtEntry>(), 64);
unsafe impl OnDisk for VirtEntry {}

/// Fixed head of a config record; phys_refnum[MPPE] then lba_offset[MPPE]
/// follow on disk, padded with 0xFF to `config_record_len` sectors.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VdConfHead {
    pub magic: Be32,
    pub crc: Be32,
    pub guid: [u8; DDF_GUID_LEN],
    pub timestamp: Be32,
    pub seqnum: Be32,
    pub pad0: [u8; 24],
    pub prim_elmnt_count: Be16,
    pub chunk_shift: u8,
    pub prl: u8,
    pub rlq: u8,
    pub sec_elmnt_count: u8,
    pub sec_elmnt_seq: u8,
    pub srl: u8,
    pub blocks: Be64,
    pub array_blocks: Be64,
    pub pad1: [u8; 8],
    pub spare_refs: [Be32; 8],
    pub cache_pol: [u8; 8],
    pub bg_rate: u8,
    pub pad2: [u8; 3],
    pub pad3: [u8; 52],
    pub pad4: [u8; 192],
    pub v0: [u8; 32],
    pub v1: [u8; 32],
    pub v2: [u8; 16],
    pub v3: [u8; 16],
    pub vendor: [u8; 32],
}

const_assert_eq!(std::mem::size_of::<VdConfHead>(), 512);
unsafe impl OnDisk for VdConfHead {}

// DDF raid personality codes
const DDF_RAID0: u8 = 0x00;
const DDF_RAID1: u8 = 0x01;
const DDF_RAID5: u8 = 0x05;
const DDF_RAID6: u8 = 0x06;
const DDF_CONCAT: u8 = 0x1f;

fn level_to_prl(lvl: i32) -> Result<u8> {
    Ok(match lvl {
        0 => DDF_RAID0,
        1 => DDF_RAID1,
        5 => DDF_RAID5,
        6 => DDF_RAID6,
        level::LINEAR => DDF_CONCAT,
        other => {
            return Err(MdError::IncompatibleMetadata(format!(
                "raid level {} not representable in ddf",
                other
            )))
        }
    })
}

fn prl_to_level(prl: u8) -> i32 {
    match prl {
        DDF_RAID0 => 0,
        DDF_RAID1 => 1,
        DDF_RAID5 => 5,
        DDF_RAID6 => 6,
        DDF_CONCAT => level::LINEAR,
        _ => level::UNSET,
    }
}

#[derive(Clone)]
pub struct VdConf {
    pub head: VdConfHead,
    pub phys_refnum: Vec<u32>,
    pub lba_offset: Vec<u64>,
}

impl VdConf {
    fn record_bytes(&self) -> Vec<u8> {
        let len = CONFIG_RECORD_LEN as usize * 512;
        let mut buf = vec![0xffu8; len];
        buf[..512].copy_from_slice(self.head.as_bytes());
        for (i, r) in self.phys_refnum.iter().enumerate().take(MPPE) {
            let off = 512 + i * 4;
            buf[off..off + 4].copy_from_slice(&r.to_be_bytes());
        }
        let lba_base = 512 + MPPE * 4;
        for (i, l) in self.lba_offset.iter().enumerate().take(MPPE) {
            let off = lba_base + i * 8;
            buf[off..off + 8].copy_from_slice(&l.to_be_bytes());
        }
        // crc over the whole record with the field preset
        buf[4..8].copy_from_slice(&0xffffffffu32.to_be_bytes());
        let crc = ddf_crc(&buf);
        buf[4..8].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Option<VdConf> {
        let head = VdConfHead::read_from(buf)?;
        if head.magic.get() != DDF_VD_CONF_MAGIC {
            return None;
        }
        let mut check = buf.to_vec();
        let stored = head.crc.get();
        check[4..8].copy_from_slice(&0xffffffffu32.to_be_bytes());
        if ddf_crc(&check) != stored {
            return None;
        }
        let mut phys_refnum = Vec::with_capacity(MPPE);
        let mut lba_offset = Vec::with_capacity(MPPE);
        let lba_base = 512 + MPPE * 4;
        for i in 0..MPPE {
            let off = 512 + i * 4;
            phys_refnum.push(u32::from_be_bytes(buf[off..off + 4].try_into().ok()?));
            let loff = lba_base + i * 8;
            lba_offset.push(u64::from_be_bytes(buf[loff..loff + 8].try_into().ok()?));
        }
        Some(VdConf { head, phys_refnum, lba_offset })
    }
}

/// One physical member with its open handle.
pub struct DdfDisk {
    pub disk: DiskInfo,
    pub refnum: u32,
    pub size_sectors: u64,
    pub dev: Option<BlockDevice>,
}

fn random_guid(prefix: &[u8]) -> [u8; DDF_GUID_LEN] {
    let mut guid = [0u8; DDF_GUID_LEN];
    let n = prefix.len().min(8);
    guid[..n].copy_from_slice(&prefix[..n]);
    for b in guid[n..].iter_mut() {
        *b = rand::random();
    }
    guid
}

fn crc_section<T: OnDisk + Copy>(rec: &T, crc_offset: usize) -> u32 {
    let mut bytes = rec.as_bytes().to_vec();
    bytes[crc_offset..crc_offset + 4].copy_from_slice(&0xffffffffu32.to_be_bytes());
    ddf_crc(&bytes)
}

fn table_bytes<E: OnDisk + Copy>(header: TableHeader, entries: &[E], max_entries: usize) -> Vec<u8> {
    let mut buf = header.as_bytes().to_vec();
    for e in entries {
        buf.extend_from_slice(e.as_bytes());
    }
    buf.resize(64 + 64 * max_entries.max(entries.len()), 0xff);
    buf.resize((buf.len() + 511) / 512 * 512, 0xff);
    buf[4..8].copy_from_slice(&0xffffffffu32.to_be_bytes());
    let crc = ddf_crc(&buf);
    buf[4..8].copy_from_slice(&crc.to_be_bytes());
    buf
}

pub struct Ddf {
    pub anchor: Option<DdfHeader>,
    pub controller: DdfController,
    pub pd: Vec<PhysEntry>,
    pub vd: Vec<VirtEntry>,
    pub confs: Vec<VdConf>,
    pub disks: Vec<DdfDisk>,
    /// volume currently being operated on (subarray index)
    pub current_vol: Option<usize>,
    dirty: bool,
    pending_updates: Vec<MetaUpdate>,
}

impl Ddf {
    pub fn new() -> Self {
        let mut controller: DdfController = unsafe { std::mem::zeroed() };
        controller.magic = Be32::new(DDF_CONTROLLER_MAGIC);
        controller.guid = random_guid(b"Linux-MD");
        controller.product_id[..8].copy_from_slice(b"MDCTL   ");
        Ddf {
            anchor: None,
            controller,
            pd: Vec::new(),
            vd: Vec::new(),
            confs: Vec::new(),
            disks: Vec::new(),
            current_vol: None,
            dirty: false,
            pending_updates: Vec::new(),
        }
    }

    fn anchor_ref(&self) -> Result<&DdfHeader> {
        self.anchor
            .as_ref()
            .ok_or(MdError::IncompatibleMetadata("no ddf metadata loaded".into()))
    }

    fn read_header(dev: &mut BlockDevice, lba: u64, expect_type: u8) -> Result<DdfHeader> {
        let mut buf = [0u8; 512];
        dev.read_at(lba * 512, &mut buf)?;
        let hdr = DdfHeader::read_from(&buf).ok_or(MdError::NoMagic)?;
        if hdr.magic.get() != DDF_HEADER_MAGIC {
            return Err(MdError::NoMagic);
        }
        let stored = hdr.crc.get();
        let computed = crc_section(&hdr, 4);
        if stored != computed {
            return Err(MdError::BadChecksum { stored, computed });
        }
        if hdr.htype != expect_type {
            return Err(MdError::WrongVersion(format!("ddf header type {}", hdr.htype)));
        }
        Ok(hdr)
    }

    fn read_table<E: OnDisk + Copy>(
        dev: &mut BlockDevice,
        base_lba: u64,
        offset: u32,
        len_sectors: u32,
        magic: u32,
    ) -> Result<(TableHeader, Vec<E>)> {
        let mut buf = vec![0u8; len_sectors as usize * 512];
        dev.read_at((base_lba + offset as u64) * 512, &mut buf)?;
        let header = TableHeader::read_from(&buf).ok_or(MdError::NoMagic)?;
        if header.magic.get() != magic {
            return Err(MdError::NoMagic);
        }
        let stored = header.crc.get();
        let mut check = buf.clone();
        check[4..8].copy_from_slice(&0xffffffffu32.to_be_bytes());
        let computed = ddf_crc(&check);
        if stored != computed {
            return Err(MdError::BadChecksum { stored, computed });
        }
        let mut entries = Vec::new();
        for i in 0..header.populated.get() as usize {
            let off = 64 + i * std::mem::size_of::<E>();
            match E::read_from(&buf[off..]) {
                Some(e) => entries.push(e),
                None => break,
            }
        }
        Ok((header, entries))
    }

    fn load_one(&mut self, dev: &mut BlockDevice) -> Result<()> {
        let dsize = dev.size_sectors()?;
        if dsize < WORKSPACE_SECTORS + 2 {
            return Err(MdError::TooSmall(dsize));
        }
        let anchor = Self::read_header(dev, dsize - 1, HEADER_ANCHOR)?;
        let primary = Self::read_header(dev, anchor.primary_lba.get(), HEADER_PRIMARY)
            .or_else(|_| Self::read_header(dev, anchor.secondary_lba.get(), HEADER_SECONDARY))?;
        let base = if primary.htype == HEADER_PRIMARY {
            anchor.primary_lba.get()
        } else {
            anchor.secondary_lba.get()
        };
        let (_, pd) = Self::read_table::<PhysEntry>(
            dev,
            base,
            primary.phys_section_offset.get(),
            primary.phys_section_length.get(),
            DDF_PHYS_RECORDS_MAGIC,
        )?;
        let (_, vd) = Self::read_table::<VirtEntry>(
            dev,
            base,
            primary.virt_section_offset.get(),
            primary.virt_section_length.get(),
            DDF_VIRT_RECORDS_MAGIC,
        )?;
        let mut ctl_buf = [0u8; 512];
        dev.read_at(
            (base + primary.controller_section_offset.get() as u64) * 512,
            &mut ctl_buf,
        )?;
        if let Some(ctl) = DdfController::read_from(&ctl_buf) {
            if ctl.magic.get() == DDF_CONTROLLER_MAGIC {
                self.controller = ctl;
            }
        }
        // config records
        let mut confs = Vec::new();
        let cfg_off = primary.config_section_offset.get() as u64;
        let cfg_len = primary.config_section_length.get() as u64;
        let rec_len = primary.config_record_len.get().max(1) as u64;
        let mut rec = 0;
        while (rec + 1) * rec_len <= cfg_len {
            let mut buf = vec![0u8; rec_len as usize * 512];
            dev.read_at((base + cfg_off + rec * rec_len) * 512, &mut buf)?;
            if let Some(vc) = VdConf::parse(&buf) {
                confs.push(vc);
            }
            rec += 1;
        }
        // newest sequence wins across members
        if self
            .anchor
            .as_ref()
            .map_or(true, |a| a.seq.get() < anchor.seq.get())
        {
            self.anchor = Some(anchor);
            self.pd = pd;
            self.vd = vd;
            self.confs = confs;
        }
        Ok(())
    }

    fn layout_header(&self, dsize: u64) -> DdfHeader {
        // sections live in the reserved space right before the workspace at
        // the end of the device
        let mut hdr: DdfHeader = unsafe { std::mem::zeroed() };
        hdr.magic = Be32::new(DDF_HEADER_MAGIC);
        hdr.guid = self.anchor.map(|a| a.guid).unwrap_or_else(|| random_guid(b"MDCTL-C"));
        hdr.revision = *b"01.02.00";
        hdr.seq = Be32::new(self.anchor.map(|a| a.seq.get()).unwrap_or(1));
        hdr.timestamp = Be32::new(now_secs() as u32);
        hdr.pad0 = 0xff;
        hdr.pad1 = [0xff; 12];
        hdr.pad2 = [0xff; 3];
        hdr.pad3 = [0xff; 54];
        hdr.pad4 = [0xff; 256];
        hdr.header_ext = [0xff; 32];
        hdr.openflag = 0xff;

        let pd_sectors = ((64 + MAX_PD_ENTRIES * 64 + 511) / 512) as u32;
        let vd_sectors = ((64 + MAX_VD_ENTRIES * 64 + 511) / 512) as u32;
        let cfg_sectors = (CONFIG_RECORD_LEN as u32) * (MAX_VD_ENTRIES as u32 + 1);
        let total = 1 + 1 + pd_sectors + vd_sectors + cfg_sectors; // hdr + ctrl + tables
        let primary = dsize - 1 - WORKSPACE_SECTORS - total as u64;
        hdr.primary_lba = Be64::new(primary);
        hdr.secondary_lba = Be64::new(!0u64);
        hdr.workspace_len = Be32::new(WORKSPACE_SECTORS as u32);
        hdr.workspace_lba = Be64::new(dsize - 1 - WORKSPACE_SECTORS);
        hdr.max_pd_entries = Be16::new(MAX_PD_ENTRIES as u16);
        hdr.max_vd_entries = Be16::new(MAX_VD_ENTRIES as u16);
        hdr.max_partitions = Be16::new(MAX_VD_ENTRIES as u16);
        hdr.config_record_len = Be16::new(CONFIG_RECORD_LEN);
        hdr.max_primary_element_entries = Be16::new(MPPE as u16);
        hdr.controller_section_offset = Be32::new(1);
        hdr.controller_section_length = Be32::new(1);
        hdr.phys_section_offset = Be32::new(2);
        hdr.phys_section_length = Be32::new(pd_sectors);
        hdr.virt_section_offset = Be32::new(2 + pd_sectors);
        hdr.virt_section_length = Be32::new(vd_sectors);
        hdr.config_section_offset = Be32::new(2 + pd_sectors + vd_sectors);
        hdr.config_section_length = Be32::new(cfg_sectors);
        hdr
    }

    fn store_one(&self, dev: &mut BlockDevice, refnum: u32) -> Result<()> {
        let dsize = dev.size_sectors()?;
        let mut hdr = self.layout_header(dsize);
        let base = hdr.primary_lba.get();

        let mut ctl = self.controller;
        ctl.crc = Be32::new(crc_section(&ctl, 4));
        dev.write_at((base + 1) * 512, ctl.as_bytes())?;

        let mut pd_header: TableHeader = unsafe { std::mem::zeroed() };
        pd_header.magic = Be32::new(DDF_PHYS_RECORDS_MAGIC);
        pd_header.populated = Be16::new(self.pd.len() as u16);
        pd_header.max = Be16::new(MAX_PD_ENTRIES as u16);
        pd_header.pad = [0xff; 52];
        let pd_bytes = table_bytes(pd_header, &self.pd, MAX_PD_ENTRIES);
        dev.write_at((base + hdr.phys_section_offset.get() as u64) * 512, &pd_bytes)?;

        let mut vd_header: TableHeader = unsafe { std::mem::zeroed() };
        vd_header.magic = Be32::new(DDF_VIRT_RECORDS_MAGIC);
        vd_header.populated = Be16::new(self.vd.len() as u16);
        vd_header.max = Be16::new(MAX_VD_ENTRIES as u16);
        vd_header.pad = [0xff; 52];
        let vd_bytes = table_bytes(vd_header, &self.vd, MAX_VD_ENTRIES);
        dev.write_at((base + hdr.virt_section_offset.get() as u64) * 512, &vd_bytes)?;

        // config records: only those this disk participates in, padded out
        // with 0xFF sectors
        let cfg_base = base + hdr.config_section_offset.get() as u64;
        let mut rec = 0u64;
        for vc in &self.confs {
            if !vc.phys_refnum.iter().any(|&r| r == refnum) {
                continue;
            }
            dev.write_at((cfg_base + rec * CONFIG_RECORD_LEN as u64) * 512, &vc.record_bytes())?;
            rec += 1;
        }
        let blank = vec![0xffu8; CONFIG_RECORD_LEN as usize * 512];
        while rec < (MAX_VD_ENTRIES as u64 + 1) {
            dev.write_at((cfg_base + rec * CONFIG_RECORD_LEN as u64) * 512, &blank)?;
            rec += 1;
        }

        // primary header, then the anchor in the last sector, always last
        hdr.htype = HEADER_PRIMARY;
        hdr.crc = Be32::new(crc_section(&hdr, 4));
        dev.write_at(base * 512, hdr.as_bytes())?;
        dev.sync()?;

        hdr.htype = HEADER_ANCHOR;
        hdr.crc = Be32::new(crc_section(&hdr, 4));
        dev.write_at((dsize - 1) * 512, hdr.as_bytes())?;
        dev.sync()
    }

    fn vd_uuid(&self, guid: &[u8; DDF_GUID_LEN]) -> [u8; 16] {
        let mut h = Sha1::new();
        h.update(guid);
        let digest = h.finalize();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&digest[..16]);
        uuid
    }

    fn conf_for_vol(&self, vol: usize) -> Result<&VdConf> {
        let ve = self
            .vd
            .get(vol)
            .ok_or(MdError::IncompatibleMetadata(format!("no volume {}", vol)))?;
        self.confs
            .iter()
            .find(|c| c.head.guid == ve.guid)
            .ok_or(MdError::IncompatibleMetadata(format!("no config record for volume {}", vol)))
    }

    fn info_for_vol(&self, vol: usize) -> Result<MdInfo> {
        let ve = &self.vd[vol];
        let vc = self.conf_for_vol(vol)?;
        let mut info = MdInfo::default();
        info.array.major_version = -1;
        info.array.minor_version = -2;
        info.array.level = prl_to_level(vc.head.prl);
        info.array.raid_disks = vc.head.prim_elmnt_count.get() as i32;
        info.array.layout = if info.array.level == 5 { 2 } else { 0 };
        info.array.chunk_size = 512 << vc.head.chunk_shift;
        info.array.utime = vc.head.timestamp.get() as u64;
        info.component_size = vc.head.blocks.get();
        info.custom_array_size = vc.head.array_blocks.get();
        info.events = vc.head.seqnum.get() as u64;
        info.uuid = self.vd_uuid(&ve.guid);
        let end = ve.name.iter().position(|&b| b == 0).unwrap_or(16);
        info.name = String::from_utf8_lossy(&ve.name[..end]).into_owned();
        info.text_version = format!("/{}", vol);
        info.array.working_disks = vc
            .phys_refnum
            .iter()
            .take(info.array.raid_disks as usize)
            .filter(|&&r| r != 0 && r != !0u32)
            .count() as i32;
        info.array.active_disks = info.array.working_disks;
        Ok(info)
    }

    /// Allocate a refnum no other disk in the container uses.
    fn fresh_refnum(&self) -> u32 {
        loop {
            let r: u32 = rand::random();
            if r == 0 || r == !0u32 {
                continue;
            }
            if !self.pd.iter().any(|p| p.refnum.get() == r) {
                return r;
            }
        }
    }

    /// Free extent check: the largest gap on `refnum` not used by any
    /// volume, in sectors.
    fn free_space(&self, refnum: u32, size: u64) -> u64 {
        let mut used: Vec<(u64, u64)> = Vec::new();
        for vc in &self.confs {
            for (i, &r) in vc.phys_refnum.iter().enumerate() {
                if r == refnum {
                    used.push((vc.lba_offset[i], vc.head.blocks.get()));
                }
            }
        }
        used.sort_unstable();
        let mut pos = 0u64;
        let mut best = 0u64;
        for (start, len) in used {
            if start > pos {
                best = best.max(start - pos);
            }
            pos = pos.max(start + len);
        }
        let end = size.saturating_sub(WORKSPACE_SECTORS + 1024);
        if end > pos {
            best = best.max(end - pos);
        }
        best
    }
}

impl Default for Ddf {
    fn default() -> Self {
        Self::new()
    }
}

impl Metadata for Ddf {
    fn family(&self) -> Family {
        Family::Ddf
    }

    fn name(&self) -> String {
        "ddf".into()
    }

    fn text_version(&self) -> String {
        "ddf".into()
    }

    fn is_external(&self) -> bool {
        true
    }

    fn loaded(&self) -> bool {
        self.anchor.is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn load(&mut self, dev: &mut BlockDevice) -> Result<()> {
        self.free_super();
        self.load_one(dev)
    }

    fn free_super(&mut self) {
        self.anchor = None;
        self.pd.clear();
        self.vd.clear();
        self.confs.clear();
        self.disks.clear();
        self.current_vol = None;
        self.dirty = false;
        self.pending_updates.clear();
    }

    fn getinfo(&self) -> Result<MdInfo> {
        if let Some(vol) = self.current_vol {
            return self.info_for_vol(vol);
        }
        let anchor = self.anchor_ref()?;
        let mut info = MdInfo::default();
        info.array.major_version = -1;
        info.array.minor_version = -2;
        info.array.level = level::CONTAINER;
        info.array.raid_disks = self.pd.len() as i32;
        info.array.working_disks = self.pd.len() as i32;
        info.uuid = self.vd_uuid(&anchor.guid);
        info.events = anchor.seq.get() as u64;
        info.text_version = "ddf".into();
        info.name = "ddf".into();
        Ok(info)
    }

    fn uuid(&self) -> Result<[u8; 16]> {
        if let Some(vol) = self.current_vol {
            let ve = &self.vd[vol];
            return Ok(self.vd_uuid(&ve.guid));
        }
        Ok(self.vd_uuid(&self.anchor_ref()?.guid))
    }

    fn match_home(&self, homehost: &str) -> Result<bool> {
        // DDF is vendor metadata; treat as local only for the magic name
        Ok(homehost == "any")
    }

    fn compare(&mut self, other: &dyn Metadata) -> Result<()> {
        let other = other
            .as_any()
            .downcast_ref::<Ddf>()
            .ok_or_else(|| MdError::IncompatibleMetadata("different metadata family".into()))?;
        let oa = other.anchor_ref()?;
        if self.anchor.is_none() {
            self.anchor = Some(*oa);
            self.pd = other.pd.clone();
            self.vd = other.vd.clone();
            self.confs = other.confs.clone();
            return Ok(());
        }
        if self.anchor_ref()?.guid != oa.guid {
            return Err(MdError::IncompatibleMetadata("container guid mismatch".into()));
        }
        // the higher sequence wins
        if self.anchor_ref()?.seq.get() < oa.seq.get() {
            self.anchor = Some(*oa);
            self.pd = other.pd.clone();
            self.vd = other.vd.clone();
            self.confs = other.confs.clone();
        }
        Ok(())
    }

    fn update(&mut self, _info: &mut MdInfo, update: &Update) -> Result<bool> {
        match update {
            Update::Uuid(_) | Update::Name { .. } | Update::HomeHost(_) => Err(
                MdError::IncompatibleMetadata("ddf identity is derived from guids".into()),
            ),
            Update::Resync | Update::Force | Update::Assemble => {
                let anchor = self
                    .anchor
                    .as_mut()
                    .ok_or(MdError::IncompatibleMetadata("no ddf metadata loaded".into()))?;
                anchor.seq.set(anchor.seq.get() + 1);
                self.dirty = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn init(&mut self, info: &CreateInfo) -> Result<()> {
        // a fresh container: tables start empty, volumes are added later
        self.free_super();
        let mut anchor: DdfHeader = unsafe { std::mem::zeroed() };
        anchor.magic = Be32::new(DDF_HEADER_MAGIC);
        anchor.guid = random_guid(b"MDCTL-C");
        anchor.revision = *b"01.02.00";
        anchor.seq = Be32::new(1);
        anchor.timestamp = Be32::new(now_secs() as u32);
        self.anchor = Some(anchor);
        self.dirty = true;
        if !info.name.is_empty() && info.level != level::CONTAINER {
            return Err(MdError::IncompatibleMetadata(
                "ddf volumes are created inside a container".into(),
            ));
        }
        Ok(())
    }

    fn add_to_super(&mut self, dk: &DiskInfo, dev: Option<BlockDevice>) -> Result<()> {
        self.anchor_ref()?;
        let refnum = self.fresh_refnum();
        let size = dev.as_ref().map(|d| d.size_sectors().unwrap_or(0)).unwrap_or(0);
        let mut pe: PhysEntry = unsafe { std::mem::zeroed() };
        pe.guid = random_guid(b"MDCTL-D");
        pe.refnum = Be32::new(refnum);
        pe.ptype = Be16::new(DDF_GLOBAL_SPARE);
        pe.state = Be16::new(DDF_ONLINE);
        pe.config_size = Be64::new(size.saturating_sub(WORKSPACE_SECTORS + 1024));
        pe.path = [0xff; 18];
        pe.pad = [0xff; 6];
        if self.pd.len() >= MAX_PD_ENTRIES {
            return Err(MdError::IncompatibleMetadata("phys disk table full".into()));
        }
        self.pd.push(pe);
        self.disks.push(DdfDisk { disk: dk.clone(), refnum, size_sectors: size, dev });
        self.dirty = true;
        Ok(())
    }

    fn remove_from_super(&mut self, dk: &DiskInfo) -> Result<()> {
        if let Some(pos) = self
            .disks
            .iter()
            .position(|d| d.disk.major == dk.major && d.disk.minor == dk.minor)
        {
            let refnum = self.disks[pos].refnum;
            self.disks.remove(pos);
            self.pd.retain(|p| p.refnum.get() != refnum);
            self.dirty = true;
        }
        Ok(())
    }

    fn store(&mut self, dev: &mut BlockDevice) -> Result<()> {
        // single-device store: use the refnum recorded for it, or write all
        // records when unknown
        let refnum = self
            .disks
            .iter()
            .find(|d| d.dev.as_ref().map(|x| x.path()) == Some(dev.path()))
            .map(|d| d.refnum)
            .unwrap_or(!0u32);
        self.store_one(dev, refnum)
    }

    fn write_init(&mut self) -> Result<()> {
        self.sync_metadata()
    }

    fn avail_size(&self, dev_sectors: u64) -> u64 {
        dev_sectors.saturating_sub(WORKSPACE_SECTORS + 1024)
    }

    fn examine(&self, w: &mut dyn Write) -> Result<()> {
        let anchor = self.anchor_ref()?;
        writeln!(w, "          Magic : {:08x}", anchor.magic.get())?;
        writeln!(w, "        Version : {}", String::from_utf8_lossy(&anchor.revision))?;
        writeln!(w, " Container GUID : {}", hex::encode(anchor.guid))?;
        writeln!(w, "            Seq : {:08x}", anchor.seq.get())?;
        writeln!(w, "  Redundant hdr : {}", if anchor.secondary_lba.get() != !0u64 { "yes" } else { "no" })?;
        writeln!(w, "  Virtual Disks : {}", self.vd.len())?;
        writeln!(w)?;
        for (i, ve) in self.vd.iter().enumerate() {
            let end = ve.name.iter().position(|&b| b == 0).unwrap_or(16);
            writeln!(w, "      VD GUID[{}] : {}", i, hex::encode(ve.guid))?;
            writeln!(w, "           unit : {}", ve.unit.get())?;
            writeln!(w, "           name : {}", String::from_utf8_lossy(&ve.name[..end]))?;
            if let Ok(vc) = self.conf_for_vol(i) {
                writeln!(
                    w,
                    "     Raid Level : {}",
                    mdctl_core::model::level_name(prl_to_level(vc.head.prl)).unwrap_or("?")
                )?;
                writeln!(w, "  Raid Devices : {}", vc.head.prim_elmnt_count.get())?;
                writeln!(w, "     Chunk Size : {}K", (512 << vc.head.chunk_shift) / 1024)?;
            }
        }
        writeln!(w)?;
        writeln!(w, " Physical Disks : {}", self.pd.len())?;
        for pe in &self.pd {
            writeln!(
                w,
                "    {:08x} [{}{}{}]",
                pe.refnum.get(),
                if pe.state.get() & DDF_ONLINE != 0 { "online" } else { "offline" },
                if pe.state.get() & DDF_FAILED != 0 { ",failed" } else { "" },
                if pe.ptype.get() & (DDF_GLOBAL_SPARE | DDF_SPARE) != 0 { ",spare" } else { "" },
            )?;
        }
        Ok(())
    }

    fn brief_examine(&self, w: &mut dyn Write) -> Result<()> {
        let uuid = self.uuid()?;
        writeln!(
            w,
            "ARRAY metadata=ddf UUID={}",
            mdctl_core::model::uuid_text(&uuid)
        )?;
        Ok(())
    }

    fn export_examine(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "MD_METADATA=ddf")?;
        writeln!(w, "MD_UUID={}", mdctl_core::model::uuid_text(&self.uuid()?))?;
        Ok(())
    }

    fn detail(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "           UUID : {}", mdctl_core::model::uuid_text(&self.uuid()?))?;
        Ok(())
    }

    fn brief_detail(&self, w: &mut dyn Write) -> Result<()> {
        write!(w, " UUID={}", mdctl_core::model::uuid_text(&self.uuid()?))?;
        Ok(())
    }

    // --- container capabilities ---

    fn load_container(&mut self, members: &[ContainerMember]) -> Result<()> {
        self.free_super();
        for m in members {
            let mut dev = BlockDevice::open_rw(&m.path)?;
            match self.load_one(&mut dev) {
                Ok(()) => {}
                Err(e) if e.is_probe_miss() => {
                    log::warn!("{}: no usable ddf metadata: {}", m.path.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            let size = dev.size_sectors()?;
            // refnum comes from the phys table entry whose config_size
            // matches; fall back to path order
            let refnum = self
                .pd
                .get(self.disks.len())
                .map(|p| p.refnum.get())
                .unwrap_or_else(|| rand::random());
            self.disks.push(DdfDisk {
                disk: DiskInfo { major: m.major, minor: m.minor, ..Default::default() },
                refnum,
                size_sectors: size,
                dev: Some(dev),
            });
        }
        if self.anchor.is_none() {
            return Err(MdError::NoMagic);
        }
        Ok(())
    }

    fn container_content(&self) -> Result<Vec<MdInfo>> {
        (0..self.vd.len()).map(|i| self.info_for_vol(i)).collect()
    }

    fn open_subarray(&mut self, subarray: &str) -> Result<usize> {
        let vol: usize = subarray
            .parse()
            .map_err(|_| MdError::IncompatibleMetadata(format!("bad subarray '{}'", subarray)))?;
        if vol >= self.vd.len() {
            return Err(MdError::IncompatibleMetadata(format!("no subarray {}", vol)));
        }
        self.current_vol = Some(vol);
        Ok(vol)
    }

    fn set_array_state(&mut self, inst: usize, clean: bool, resync_start: u64) -> Result<()> {
        let ve = self
            .vd
            .get_mut(inst)
            .ok_or(MdError::IncompatibleMetadata(format!("no volume {}", inst)))?;
        let state = ve.state & !DDF_STATE_MASK;
        let degraded = ve.state & DDF_STATE_MASK == DDF_STATE_DEGRADED;
        ve.state = state
            | if degraded {
                DDF_STATE_DEGRADED
            } else {
                DDF_STATE_OPTIMAL
            };
        // dirty/clean is tracked in init_state bit 7 here
        if clean && resync_start == mdctl_core::model::MAX_SECTOR {
            ve.init_state &= !0x80;
        } else {
            ve.init_state |= 0x80;
        }
        self.dirty = true;
        Ok(())
    }

    fn set_disk(&mut self, inst: usize, slot: i32, state: u32) -> Result<()> {
        let vc = self.conf_for_vol(inst)?;
        let refnum = *vc
            .phys_refnum
            .get(slot as usize)
            .ok_or(MdError::IncompatibleMetadata(format!("no slot {}", slot)))?;
        let pe = self
            .pd
            .iter_mut()
            .find(|p| p.refnum.get() == refnum)
            .ok_or(MdError::IncompatibleMetadata("slot refers to unknown disk".into()))?;
        if state & dev_state::FAULTY != 0 {
            pe.state.set(pe.state.get() | DDF_FAILED);
            pe.ptype.set(pe.ptype.get() & !DDF_ACTIVE_IN_VD);
            let ve = &mut self.vd[inst];
            ve.state = (ve.state & !DDF_STATE_MASK) | DDF_STATE_DEGRADED;
        } else if state & dev_state::INSYNC != 0 {
            pe.state.set((pe.state.get() | DDF_ONLINE) & !(DDF_REBUILDING | DDF_FAILED));
        }
        self.dirty = true;
        Ok(())
    }

    fn sync_metadata(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        {
            let anchor = self
                .anchor
                .as_mut()
                .ok_or(MdError::IncompatibleMetadata("no ddf metadata loaded".into()))?;
            anchor.seq.set(anchor.seq.get() + 1);
        }
        let mut wrote = 0;
        let snapshot: Vec<(usize, u32)> = self
            .disks
            .iter()
            .enumerate()
            .map(|(i, d)| (i, d.refnum))
            .collect();
        for (i, refnum) in snapshot {
            // move the handle out to satisfy the borrow, put it back after
            let Some(mut dev) = self.disks[i].dev.take() else { continue };
            match self.store_one(&mut dev, refnum) {
                Ok(()) => wrote += 1,
                Err(e) => {
                    log::warn!("ddf store failed on {}: {}", dev.path().display(), e);
                    let pe = self.pd.iter_mut().find(|p| p.refnum.get() == refnum);
                    if let Some(pe) = pe {
                        pe.state.set(pe.state.get() | DDF_FAILED);
                    }
                }
            }
            self.disks[i].dev = Some(dev);
        }
        if wrote == 0 {
            return Err(MdError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "metadata written to no ddf member",
            )));
        }
        self.dirty = false;
        Ok(())
    }

    fn process_update(&mut self, update: &MetaUpdate) -> Result<()> {
        match update.kind {
            // a full vd_config record replacing or adding a volume
            k if k == DDF_VD_CONF_MAGIC => {
                let vc = VdConf::parse(&update.buf)
                    .ok_or(MdError::IncompatibleMetadata("bad vd_config update".into()))?;
                match self.confs.iter_mut().find(|c| c.head.guid == vc.head.guid) {
                    Some(slot) => *slot = vc,
                    None => self.confs.push(vc),
                }
                self.dirty = true;
                Ok(())
            }
            // phys table replacement
            k if k == DDF_PHYS_RECORDS_MAGIC => {
                let mut pd = Vec::new();
                for chunk in update.buf.chunks_exact(std::mem::size_of::<PhysEntry>()) {
                    if let Some(pe) = PhysEntry::read_from(chunk) {
                        pd.push(pe);
                    }
                }
                self.pd = pd;
                self.dirty = true;
                Ok(())
            }
            other => Err(MdError::IncompatibleMetadata(format!(
                "unknown ddf update kind {:#x}",
                other
            ))),
        }
    }

    fn activate_spare(&mut self, inst: usize) -> Result<Option<SpareAssign>> {
        let vc = self.conf_for_vol(inst)?.clone();
        let need = vc.head.blocks.get();
        let raid_disks = vc.head.prim_elmnt_count.get() as usize;
        // first free slot
        let Some(slot) = (0..raid_disks)
            .find(|&i| vc.phys_refnum[i] == 0 || vc.phys_refnum[i] == !0u32)
        else {
            return Ok(None);
        };
        // dedicated spares win over global spares
        let mut candidate = None;
        for pass in [DDF_SPARE, DDF_GLOBAL_SPARE] {
            for pe in &self.pd {
                let t = pe.ptype.get();
                if t & pass == 0 || t & DDF_ACTIVE_IN_VD != 0 {
                    continue;
                }
                if pe.state.get() & (DDF_FAILED | DDF_MISSING) != 0 {
                    continue;
                }
                let refnum = pe.refnum.get();
                if vc.phys_refnum.iter().any(|&r| r == refnum) {
                    continue;
                }
                if self.free_space(refnum, pe.config_size.get()) < need {
                    continue;
                }
                candidate = Some(refnum);
                break;
            }
            if candidate.is_some() {
                break;
            }
        }
        let Some(refnum) = candidate else { return Ok(None) };

        let mut nvc = vc;
        nvc.phys_refnum[slot] = refnum;
        nvc.lba_offset[slot] = 0;
        nvc.head.seqnum.set(nvc.head.seqnum.get() + 1);
        let update = MetaUpdate { kind: DDF_VD_CONF_MAGIC, buf: nvc.record_bytes() };

        // mark the spare active and rebuilding right away; the queued update
        // re-applies the same state on the monitor side
        if let Some(pe) = self.pd.iter_mut().find(|p| p.refnum.get() == refnum) {
            pe.ptype.set(pe.ptype.get() | DDF_ACTIVE_IN_VD);
            pe.state.set(pe.state.get() | DDF_REBUILDING);
        }
        let disk = self
            .disks
            .iter()
            .find(|d| d.refnum == refnum)
            .map(|d| {
                let mut di = d.disk.clone();
                di.raid_disk = slot as i32;
                di.state = 0;
                di
            })
            .unwrap_or_else(|| DiskInfo { raid_disk: slot as i32, ..Default::default() });
        Ok(Some(SpareAssign { disk, data_offset: 0, update }))
    }

    fn min_acceptable_spare_size(&self) -> u64 {
        self.confs
            .iter()
            .map(|c| c.head.blocks.get())
            .min()
            .unwrap_or(0)
            + WORKSPACE_SECTORS
    }
}

/// Create a volume config record inside a loaded container.
pub fn create_volume(
    ddf: &mut Ddf,
    name: &str,
    level_: i32,
    raid_disks: usize,
    chunk_bytes: u32,
    blocks: u64,
    member_refnums: &[u32],
) -> Result<usize> {
    if ddf.vd.len() >= MAX_VD_ENTRIES {
        return Err(MdError::IncompatibleMetadata("virtual disk table full".into()));
    }
    let mut ve: VirtEntry = unsafe { std::mem::zeroed() };
    ve.guid = random_guid(b"MDCTL-V");
    ve.unit = Be16::new(ddf.vd.len() as u16);
    ve.pad0 = Be16::new(0xffff);
    ve.state = DDF_STATE_OPTIMAL;
    let n = name.len().min(16);
    ve.name[..n].copy_from_slice(&name.as_bytes()[..n]);

    let mut head: VdConfHead = unsafe { std::mem::zeroed() };
    head.magic = Be32::new(DDF_VD_CONF_MAGIC);
    head.guid = ve.guid;
    head.timestamp = Be32::new(now_secs() as u32);
    head.seqnum = Be32::new(1);
    head.prim_elmnt_count = Be16::new(raid_disks as u16);
    head.chunk_shift = (chunk_bytes / 512).trailing_zeros() as u8;
    head.prl = level_to_prl(level_)?;
    head.sec_elmnt_count = 1;
    head.blocks = Be64::new(blocks);
    let data = match level_ {
        0 => raid_disks as u64,
        1 => 1,
        5 => raid_disks as u64 - 1,
        6 => raid_disks as u64 - 2,
        _ => raid_disks as u64,
    };
    head.array_blocks = Be64::new(blocks * data);
    head.pad4 = [0xff; 192];
    head.v0 = [0xff; 32];
    head.v1 = [0xff; 32];
    head.v2 = [0xff; 16];
    head.v3 = [0xff; 16];

    let mut phys_refnum = vec![!0u32; MPPE];
    let mut lba_offset = vec![0u64; MPPE];
    for (i, &r) in member_refnums.iter().enumerate().take(raid_disks) {
        phys_refnum[i] = r;
        lba_offset[i] = 0;
        if let Some(pe) = ddf.pd.iter_mut().find(|p| p.refnum.get() == r) {
            pe.ptype.set((pe.ptype.get() | DDF_ACTIVE_IN_VD) & !DDF_GLOBAL_SPARE);
        }
    }
    ddf.vd.push(ve);
    ddf.confs.push(VdConf { head, phys_refnum, lba_offset });
    ddf.dirty = true;
    Ok(ddf.vd.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dev(sectors: u64) -> (tempfile::NamedTempFile, BlockDevice) {
        let tf = tempfile::NamedTempFile::new().unwrap();
        tf.as_file().set_len(sectors * 512).unwrap();
        let dev = BlockDevice::from_file(tf.reopen().unwrap(), tf.path());
        (tf, dev)
    }

    fn container_with_disks(n: usize, sectors: u64) -> (Vec<tempfile::NamedTempFile>, Ddf) {
        let mut ddf = Ddf::new();
        ddf.init(&CreateInfo { level: level::CONTAINER, ..Default::default() }).unwrap();
        let mut files = Vec::new();
        for i in 0..n {
            let (tf, dev) = scratch_dev(sectors);
            let dk = DiskInfo { number: i as i32, major: 8, minor: i as u32 * 16, ..Default::default() };
            ddf.add_to_super(&dk, Some(dev)).unwrap();
            files.push(tf);
        }
        (files, ddf)
    }

    #[test]
    fn container_round_trip() {
        let (files, mut ddf) = container_with_disks(2, 1 << 17);
        let refnums = [ddf.pd[0].refnum.get(), ddf.pd[1].refnum.get()];
        create_volume(&mut ddf, "vol0", 1, 2, 64 * 1024, 16384,
            &refnums).unwrap();
        ddf.sync_metadata().unwrap();

        let mut dev = BlockDevice::from_file(files[0].reopen().unwrap(), files[0].path());
        let mut back = Ddf::new();
        back.load(&mut dev).unwrap();
        assert_eq!(back.pd.len(), 2);
        assert_eq!(back.vd.len(), 1);
        let content = back.container_content().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].array.level, 1);
        assert_eq!(content[0].array.raid_disks, 2);
        assert_eq!(content[0].component_size, 16384);
        assert_eq!(content[0].name, "vol0");
    }

    #[test]
    fn anchor_crc_detects_corruption() {
        let (files, mut ddf) = container_with_disks(1, 1 << 17);
        ddf.sync_metadata().unwrap();
        let mut dev = BlockDevice::from_file(files[0].reopen().unwrap(), files[0].path());
        let anchor_off = ((1u64 << 17) - 1) * 512;
        let mut b = [0u8; 1];
        dev.read_at(anchor_off + 40, &mut b).unwrap();
        b[0] ^= 0xff;
        dev.write_at(anchor_off + 40, &b).unwrap();
        let mut back = Ddf::new();
        assert!(back.load(&mut dev).is_err());
    }

    #[test]
    fn uuid_derivation_is_stable_and_guid_scoped() {
        let (_files, mut ddf) = container_with_disks(2, 1 << 17);
        let refs = [ddf.pd[0].refnum.get(), ddf.pd[1].refnum.get()];
        let v0 = create_volume(&mut ddf, "a", 1, 2, 64 * 1024, 8192, &refs).unwrap();
        let v1 = create_volume(&mut ddf, "b", 1, 2, 64 * 1024, 8192, &refs).unwrap();
        ddf.current_vol = Some(v0);
        let u0 = ddf.uuid().unwrap();
        ddf.current_vol = Some(v1);
        let u1 = ddf.uuid().unwrap();
        assert_ne!(u0, u1);
        ddf.current_vol = Some(v0);
        assert_eq!(ddf.uuid().unwrap(), u0);
        ddf.current_vol = None;
        assert_ne!(ddf.uuid().unwrap(), u0);
    }

    #[test]
    fn spare_activation_fills_free_slot() {
        let (_files, mut ddf) = container_with_disks(3, 1 << 17);
        let refs = [ddf.pd[0].refnum.get(), ddf.pd[1].refnum.get()];
        let vol = create_volume(&mut ddf, "r1", 1, 2, 64 * 1024, 8192, &refs).unwrap();
        // fail slot 1
        ddf.set_disk(vol, 1, dev_state::FAULTY).unwrap();
        ddf.confs[0].phys_refnum[1] = !0u32;
        let assign = ddf.activate_spare(vol).unwrap().expect("spare expected");
        assert_eq!(assign.disk.raid_disk, 1);
        let spare_ref = ddf.pd[2].refnum.get();
        // the update carries the new config with the spare's refnum
        let vc = VdConf::parse(&assign.update.buf).unwrap();
        assert_eq!(vc.phys_refnum[1], spare_ref);
        let pe = ddf.pd.iter().find(|p| p.refnum.get() == spare_ref).unwrap();
        assert!(pe.ptype.get() & DDF_ACTIVE_IN_VD != 0);
        assert!(pe.state.get() & DDF_REBUILDING != 0);
    }
}
