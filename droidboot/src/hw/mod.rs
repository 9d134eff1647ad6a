//! Linux implementations of the `droidboot-core` platform ports.
//!
//! Each submodule owns one kernel interface: the SCU IPC ioctl device, the
//! power-supply class, evdev input, MMC host discovery and the generic
//! process/file/mount/reboot system calls.

pub mod control;
pub mod input;
pub mod mmc;
pub mod power;
mod system;

pub use system::{LinuxPlatform, Reboot};

use crate::config::DaemonConfig;

impl LinuxPlatform {
    /// Builds the platform from the configured device paths.
    #[must_use]
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(
            control::IpcControl::new(config.paths.control_device.clone()),
            Reboot::new(config.paths.force_shutdown.clone()),
            config.tools.clone(),
        )
    }
}
