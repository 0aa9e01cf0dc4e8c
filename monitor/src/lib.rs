//! The external-metadata monitor: a per-container daemon that reflects
//! kernel-reported device and array state back into the container metadata
//! and activates spares, plus the control-socket protocol and its client.

pub mod client;
pub mod context;
pub mod manage;
pub mod monitor;
pub mod msg;
pub mod pidfile;

pub use msg::{Command, Message, MDMON_DIR};
