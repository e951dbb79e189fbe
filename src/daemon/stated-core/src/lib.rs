//! stated core - names, records and errors
//!
//! Pure building blocks of the filesystem-backed state notification system.
//! Holds no descriptors; all file and event-queue I/O lives in `stated-system`.

pub mod config;
pub mod error;
pub mod name;
pub mod record;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use name::{Namespace, Resolver, StorageLocation};
pub use record::{RecordView, LEN_FIELD_SIZE};
