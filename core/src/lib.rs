pub mod devio;
pub mod error;
pub mod mapfile;
pub mod model;
pub mod util;

pub use devio::BlockDevice;
pub use error::MdError;
pub use mapfile::{MapEntry, MapLock};
pub use model::{ArrayInfo, DiskInfo, MdDev, MdInfo};

pub type Result<T> = std::result::Result<T, MdError>;
