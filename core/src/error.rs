use thiserror::Error;

/// Error taxonomy for the md administration core.
///
/// Metadata loads distinguish "this family is not present" (`NoMagic`,
/// `BadChecksum`, `WrongVersion`, `TooSmall`) from "the device itself is
/// unusable" (`NoDevice`, `Io`) so that callers can fall through to the next
/// family on the former and give up on the latter.
#[derive(Debug, Error)]
pub enum MdError {
    #[error("no such device: {0}")]
    NoDevice(String),

    #[error("{0} is not a block device")]
    NotBlockDevice(String),

    #[error("device too small: {0} sectors")]
    TooSmall(u64),

    #[error("no superblock magic found")]
    NoMagic,

    #[error("superblock checksum mismatch (stored {stored:#x}, computed {computed:#x})")]
    BadChecksum { stored: u32, computed: u32 },

    #[error("unsupported metadata version: {0}")]
    WrongVersion(String),

    #[error("incompatible metadata: {0}")]
    IncompatibleMetadata(String),

    #[error("device or array busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kernel does not support {0}")]
    KernelUnsupported(&'static str),

    #[error("an internal bitmap is present")]
    BitmapPresent,

    #[error("not enough devices to start the array ({avail} of {needed})")]
    NoQuorum { avail: usize, needed: usize },

    #[error("array already assembled as {0}")]
    AlreadyAssembled(String),

    #[error("reshape in progress")]
    ReshapeInProgress,

    #[error("no reshape backup found")]
    BackupMissing,

    #[error("reshape backup is stale (backup mtime {mtime}, array utime {utime})")]
    BackupStale { mtime: u64, utime: u64 },

    #[error("allocation failure")]
    AllocationFailure,
}

impl MdError {
    /// Exit status for the top-level binaries: 0 success, 1 generic failure,
    /// 2 malformed invocation or corrupt metadata, 3 allocation failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            MdError::BadChecksum { .. }
            | MdError::WrongVersion(_)
            | MdError::IncompatibleMetadata(_) => 2,
            MdError::AllocationFailure => 3,
            _ => 1,
        }
    }

    /// Whether a metadata load error means "try the next family".
    pub fn is_probe_miss(&self) -> bool {
        matches!(
            self,
            MdError::NoMagic
                | MdError::BadChecksum { .. }
                | MdError::WrongVersion(_)
                | MdError::TooSmall(_)
        )
    }
}

impl From<nix::Error> for MdError {
    fn from(e: nix::Error) -> Self {
        MdError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}
