//! System integration layer for stated
//!
//! State files, kernel event queues and the [`Client`] that ties them to the
//! name registries.

pub mod client;
pub mod global;
pub mod queue;
pub mod registry;
pub mod store;
#[cfg(feature = "async")]
pub mod watcher;

pub use client::{Client, Notification, NotificationKind};
pub use queue::{EventQueue, WatchEvent, WatchToken};
pub use stated_core::{ClientConfig, Error, Namespace, Result, StorageLocation};
#[cfg(feature = "async")]
pub use watcher::Watcher;
