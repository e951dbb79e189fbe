//! Process-wide client
//!
//! For programs that want one implicit client instead of passing a handle
//! around. The client lives until the process exits.

use std::sync::{Mutex, OnceLock, PoisonError};

use stated_core::{ClientConfig, Error, Result};
use tracing::error;

use crate::client::Client;

static CLIENT: OnceLock<Client> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Initialize the process-wide client
///
/// Fails with [`Error::AlreadyInitialized`] on every call after the first
/// successful one.
pub fn init(config: ClientConfig) -> Result<&'static Client> {
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if CLIENT.get().is_some() {
        error!("state client already initialized");
        return Err(Error::AlreadyInitialized);
    }

    let client = Client::init(config)?;
    Ok(CLIENT.get_or_init(|| client))
}

/// The process-wide client, if [`init`] succeeded
pub fn get() -> Option<&'static Client> {
    CLIENT.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_init_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("shared")).unwrap();

        let first = init(ClientConfig::rooted_at(dir.path())).unwrap();
        assert!(std::ptr::eq(first, get().unwrap()));
        assert!(matches!(
            init(ClientConfig::rooted_at(dir.path())),
            Err(Error::AlreadyInitialized)
        ));

        first.bind("global").unwrap();
        first.publish("global", b"ok").unwrap();
    }
}
