//! Name resolution
//!
//! Maps a logical name onto a file below one of two namespace roots. Names
//! starting with `user.` live in a private per-user directory that is created
//! on first use; every other name lives below the shared root.

use std::ffi::{CStr, OsStr};
use std::fs::DirBuilder;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error};

use crate::config::{ClientConfig, USER_ROOT_SUFFIX};
use crate::error::{Error, Result};

/// Prefix selecting the private namespace
pub const USER_PREFIX: &str = "user.";

/// Partition of the name space a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Per-user, owner-only directory
    Private,
    /// Global well-known directory
    Shared,
}

/// Where the state of a name is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub path: PathBuf,
    pub namespace: Namespace,
}

/// Split a name into its namespace and identifier, validating the identifier
pub fn parse(name: &str) -> Result<(Namespace, &str)> {
    let (namespace, id) = match name.strip_prefix(USER_PREFIX) {
        Some(id) => (Namespace::Private, id),
        None => (Namespace::Shared, name),
    };

    let invalid = |reason| {
        error!("illegal name {:?}: {}", name, reason);
        Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if id.starts_with('.') {
        return invalid("identifier must not begin with `.`");
    }
    // Hierarchical names are not supported; the identifier is one flat file name
    if id.is_empty() {
        return invalid("identifier is empty");
    }
    if id.contains('/') || id.contains('\0') {
        return invalid("identifier must not contain `/` or NUL");
    }

    Ok((namespace, id))
}

/// Resolves names to storage locations for one client
#[derive(Debug)]
pub struct Resolver {
    shared_root: PathBuf,
    configured_user_root: Option<PathBuf>,
    user_root: Mutex<Option<PathBuf>>,
}

impl Resolver {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            shared_root: config.shared_root.clone(),
            configured_user_root: config.user_root.clone(),
            user_root: Mutex::new(None),
        }
    }

    pub fn shared_root(&self) -> &Path {
        &self.shared_root
    }

    pub fn resolve(&self, name: &str) -> Result<StorageLocation> {
        let (namespace, id) = parse(name)?;
        let root = match namespace {
            Namespace::Shared => self.shared_root.clone(),
            Namespace::Private => self.user_root()?,
        };

        Ok(StorageLocation {
            path: root.join(id),
            namespace,
        })
    }

    /// The private root, created (owner-only) the first time it is needed
    pub fn user_root(&self) -> Result<PathBuf> {
        let mut cached = self
            .user_root
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(root) = cached.as_ref() {
            return Ok(root.clone());
        }

        let root = match &self.configured_user_root {
            Some(root) => root.clone(),
            None => home_dir()
                .ok_or_else(|| {
                    Error::Resolve("unable to determine the home directory".to_string())
                })?
                .join(USER_ROOT_SUFFIX),
        };

        // Recursive creation tolerates a concurrent creator
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&root)
            .map_err(|e| Error::io(&root, e))?;
        debug!("using private state directory {}", root.display());

        *cached = Some(root.clone());
        Ok(root)
    }
}

/// Home directory from `HOME`, falling back to the password database
pub fn home_dir() -> Option<PathBuf> {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => Some(PathBuf::from(home)),
        _ => home_from_passwd(),
    }
}

fn home_from_passwd() -> Option<PathBuf> {
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            libc::getuid(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_dir.is_null() {
        return None;
    }

    let dir = unsafe { CStr::from_ptr(pwd.pw_dir) };
    Some(PathBuf::from(OsStr::from_bytes(dir.to_bytes())))
}
