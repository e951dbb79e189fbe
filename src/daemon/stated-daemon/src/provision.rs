//! Namespace provisioning
//!
//! Creates the shared root with the configured mode and optionally backs it
//! with a size-limited tmpfs. The mount is undone by [`Provisioner::release`]
//! or on drop.

use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::ProvisionConfig;

pub struct Provisioner {
    root: PathBuf,
    config: ProvisionConfig,
    mounted: bool,
}

impl Provisioner {
    pub fn new(root: impl Into<PathBuf>, config: ProvisionConfig) -> Self {
        Self {
            root: root.into(),
            config,
            mounted: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Create the shared root and mount its tmpfs when one is configured
    pub fn prepare(&mut self) -> Result<()> {
        if !self.root.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(self.config.shared_mode)
                .create(&self.root)
                .with_context(|| format!("Failed to create {}", self.root.display()))?;
            debug!("Created shared root {}", self.root.display());
        }

        // The process umask may have narrowed the mode
        fs::set_permissions(&self.root, Permissions::from_mode(self.config.shared_mode))
            .with_context(|| format!("Failed to set mode on {}", self.root.display()))?;

        if let Some(size) = self.config.tmpfs_size {
            self.mount(size)?;
        }

        info!("Shared root ready at {}", self.root.display());
        Ok(())
    }

    fn mount(&mut self, size: u64) -> Result<()> {
        let options = format!("size={},mode={:o}", size, self.config.shared_mode);
        run(Command::new("mount")
            .args(["-t", "tmpfs", "-o", &options, "tmpfs"])
            .arg(&self.root))?;

        self.mounted = true;
        info!("Mounted {} byte tmpfs on {}", size, self.root.display());
        Ok(())
    }

    /// Unmount the tmpfs if this provisioner mounted one
    pub fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        run(Command::new("umount").arg("-f").arg(&self.root))?;
        self.mounted = false;
        info!("Unmounted {}", self.root.display());
        Ok(())
    }
}

impl Drop for Provisioner {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release {}: {:#}", self.root.display(), e);
        }
    }
}

fn run(command: &mut Command) -> Result<()> {
    debug!("Running {:?}", command);
    let status = command
        .status()
        .with_context(|| format!("Failed to run {:?}", command))?;
    if !status.success() {
        anyhow::bail!("{:?} exited with {}", command, status);
    }
    Ok(())
}
