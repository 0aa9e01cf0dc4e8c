//! Process-wide state for a running monitor, and the channels that replace
//! the original's signal-driven globals.
//!
//! Cross-thread traffic is confined to: the manager→monitor message queue,
//! a byte down the wakeup socketpair (so the monitor's poll can be
//! interrupted), and the single-slot discard channel that hands dead
//! arrays back to the manager for freeing.

use std::fs::File;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use mdctl_core::{MdDev, MdInfo, Result};
use mdctl_metadata::{MetaUpdate, Metadata};
use mdctl_sysfs::{ArrayState, SyncAction, SysArray};

use crate::msg::Command;

pub struct ActiveDev {
    pub dev: MdDev,
    pub state_fd: Option<File>,
}

/// One monitored member array of the container.
pub struct ActiveArray {
    pub devnum: i32,
    /// volume index within the container metadata
    pub inst: usize,
    pub sra: SysArray,
    pub info: MdInfo,
    pub devs: Vec<ActiveDev>,
    pub state_fd: File,
    pub action_fd: File,
    pub resync_fd: Option<File>,
    pub prev_state: ArrayState,
    pub curr_state: ArrayState,
    pub next_state: Option<ArrayState>,
    pub prev_action: SyncAction,
    pub curr_action: SyncAction,
    pub next_action: Option<SyncAction>,
    pub resync_start: u64,
    pub check_degraded: bool,
    pub deactivated: bool,
}

impl ActiveArray {
    /// Open all the fds the monitor polls for one member array.
    pub fn open(devnum: i32, inst: usize) -> Result<ActiveArray> {
        let sra = SysArray::new(&mdctl_core::util::devnum_to_name(devnum));
        let info = sra.read_info(
            mdctl_sysfs::attrs::get::LEVEL
                | mdctl_sysfs::attrs::get::LAYOUT
                | mdctl_sysfs::attrs::get::CHUNK
                | mdctl_sysfs::attrs::get::DISKS
                | mdctl_sysfs::attrs::get::COMPONENT
                | mdctl_sysfs::attrs::get::DEVS
                | mdctl_sysfs::attrs::get::OFFSET
                | mdctl_sysfs::attrs::get::SIZE
                | mdctl_sysfs::attrs::get::STATE,
        )?;
        let state_fd = sra.open_attr(None, "array_state")?;
        let action_fd = sra.open_attr(None, "sync_action")?;
        let resync_fd = sra.open_attr(None, "resync_start").ok();
        let mut devs = Vec::new();
        for d in info.devs.iter() {
            let state_fd = if d.disk.raid_disk >= 0 {
                sra.open_attr(Some(d.sys_name.as_str()), "state").ok()
            } else {
                None
            };
            devs.push(ActiveDev { dev: d.clone(), state_fd });
        }
        Ok(ActiveArray {
            devnum,
            inst,
            sra,
            info,
            devs,
            state_fd,
            action_fd,
            resync_fd,
            prev_state: ArrayState::Inactive,
            curr_state: ArrayState::Inactive,
            next_state: None,
            prev_action: SyncAction::Idle,
            curr_action: SyncAction::Idle,
            next_action: None,
            resync_start: 0,
            check_degraded: false,
            deactivated: false,
        })
    }
}

/// Everything the manager can hand the monitor.
pub enum ManagerMsg {
    NewArray(Box<ActiveArray>),
    Update(MetaUpdate),
    Command {
        cmd: Command,
        reply: mpsc::Sender<i32>,
    },
}

/// Monitor-thread half of the shared state.
pub struct MonitorSide {
    pub st: Box<dyn Metadata>,
    pub container_name: String,
    pub container_path: PathBuf,
    pub arrays: Vec<ActiveArray>,
    pub from_mgr: mpsc::Receiver<ManagerMsg>,
    pub wake_rx: UnixStream,
    /// capacity-1 channel: the discard slot
    pub discard_tx: mpsc::SyncSender<ActiveArray>,
    pub sigterm: Arc<AtomicBool>,
    pub manager_ready: Arc<AtomicBool>,
}

/// Manager-thread half.
pub struct ManagerSide {
    pub container_name: String,
    pub container_devnum: i32,
    pub to_mon: mpsc::Sender<ManagerMsg>,
    pub wake_tx: UnixStream,
    pub discard_rx: mpsc::Receiver<ActiveArray>,
    pub sigterm: Arc<AtomicBool>,
    pub manager_ready: Arc<AtomicBool>,
}

pub fn wire(
    st: Box<dyn Metadata>,
    container_name: &str,
    container_devnum: i32,
    container_path: PathBuf,
) -> Result<(MonitorSide, ManagerSide)> {
    let (to_mon, from_mgr) = mpsc::channel();
    let (discard_tx, discard_rx) = mpsc::sync_channel(1);
    let (wake_tx, wake_rx) = UnixStream::pair()?;
    wake_rx.set_nonblocking(true)?;
    wake_tx.set_nonblocking(true)?;
    let sigterm = Arc::new(AtomicBool::new(false));
    let manager_ready = Arc::new(AtomicBool::new(false));
    Ok((
        MonitorSide {
            st,
            container_name: container_name.to_string(),
            container_path,
            arrays: Vec::new(),
            from_mgr,
            wake_rx,
            discard_tx,
            sigterm: sigterm.clone(),
            manager_ready: manager_ready.clone(),
        },
        ManagerSide {
            container_name: container_name.to_string(),
            container_devnum,
            to_mon,
            wake_tx,
            discard_rx,
            sigterm,
            manager_ready,
        },
    ))
}
