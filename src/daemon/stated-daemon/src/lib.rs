//! stated daemon library
//!
//! Configuration, namespace provisioning and logging setup shared by the
//! `stated` and `statectl` binaries.

pub mod config;
pub mod logging;
pub mod provision;

pub use config::{ConfigManager, DaemonConfig};
pub use provision::Provisioner;
