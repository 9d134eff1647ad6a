//! Daemon configuration loaded from `droidboot.toml`.
//!
//! Every field has a default, so a missing file or an empty table yields the
//! stock Medfield layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use droidboot_core::ota::ifwi::{DNX_CHANNEL, IFWI_CHANNEL, IfwiChannels, PREPARE_RECORD};
use droidboot_core::partition::BootDevice;
use droidboot_core::power::charge::{CosConfig, DEFAULT_BACKLIGHT_TIMEOUT, DEFAULT_BOOT_HOLD};
use droidboot_core::power::governor::{
    DEFAULT_CHARGER_LOSS_BUDGET, DEFAULT_LOW_CAPACITY_WARNING, DEFAULT_OVER_TEMPERATURE,
    DEFAULT_SHUTDOWN_GRACE, GovernorConfig,
};
use droidboot_core::provision::{FORCE_COLD_BOOT_PATH, HSI_NODE, ProvisionConfig};
use serde::Deserialize;

use crate::error::DaemonError;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/droidboot.toml";

const DEFAULT_DOWNLOAD_CAPACITY: usize = 400 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub product: String,
    /// Boot device used when the eMMC block number cannot be detected.
    pub boot_device: String,
    pub download_capacity: usize,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Battery temperature limit in tenths of a degree Celsius.
    pub over_temperature: i32,
    pub charger_loss_budget: u8,
    pub low_capacity_warning: i32,
    pub boot_hold_ms: u64,
    pub backlight_timeout_ms: u64,
    pub paths: Paths,
    pub tools: Tools,
}

/// Device nodes and sysfs entries.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Paths {
    pub transport_device: PathBuf,
    pub enable_device: PathBuf,
    pub power_supply_root: PathBuf,
    pub control_device: PathBuf,
    pub emmc_entry: PathBuf,
    pub sdcard_entry: PathBuf,
    pub progress_file: PathBuf,
    pub force_cold_boot: String,
    pub force_shutdown: PathBuf,
    pub hsi_node: String,
    pub dnx_channel: String,
    pub ifwi_channel: String,
    pub ifwi_prepare: String,
    pub default_prop: PathBuf,
    pub recovery_binary: PathBuf,
    pub input_dir: PathBuf,
    pub backlight_root: PathBuf,
}

/// External programs invoked through the shell.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Tools {
    /// Writes a staged composite image; receives `<slot> <path>`.
    pub stitch: String,
    pub restore_payload: String,
    pub stitch_staging: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            product: "mfld".to_string(),
            boot_device: BootDevice::Sdcard.as_str().to_string(),
            download_capacity: DEFAULT_DOWNLOAD_CAPACITY,
            poll_interval_ms: 1000,
            shutdown_grace_ms: millis(DEFAULT_SHUTDOWN_GRACE),
            over_temperature: DEFAULT_OVER_TEMPERATURE,
            charger_loss_budget: DEFAULT_CHARGER_LOSS_BUDGET,
            low_capacity_warning: DEFAULT_LOW_CAPACITY_WARNING,
            boot_hold_ms: millis(DEFAULT_BOOT_HOLD),
            backlight_timeout_ms: millis(DEFAULT_BACKLIGHT_TIMEOUT),
            paths: Paths::default(),
            tools: Tools::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            transport_device: PathBuf::from("/dev/android_adb"),
            enable_device: PathBuf::from("/sys/class/android_usb/android0/enable"),
            power_supply_root: PathBuf::from("/sys/class/power_supply"),
            control_device: PathBuf::from("/dev/mid_ipc"),
            emmc_entry: PathBuf::from("/sys/devices/pci0000:00/0000:00:01.0/mmc_host/mmc0"),
            sdcard_entry: PathBuf::from("/sys/devices/pci0000:00/0000:00:04.0/mmc_host/mmc1"),
            progress_file: PathBuf::from("/tmp/progress.txt"),
            force_cold_boot: FORCE_COLD_BOOT_PATH.to_string(),
            force_shutdown: PathBuf::from(
                "/sys/module/intel_mid_osip/parameters/force_shutdown_occured",
            ),
            hsi_node: HSI_NODE.to_string(),
            dnx_channel: DNX_CHANNEL.to_string(),
            ifwi_channel: IFWI_CHANNEL.to_string(),
            ifwi_prepare: PREPARE_RECORD.to_string(),
            default_prop: PathBuf::from("/default.prop"),
            recovery_binary: PathBuf::from("/sbin/recovery"),
            input_dir: PathBuf::from("/dev/input"),
            backlight_root: PathBuf::from("/sys/devices/virtual/backlight"),
        }
    }
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            stitch: "flash_stitched --slot".to_string(),
            restore_payload: "update_osip --restore-payload".to_string(),
            stitch_staging: "/tmp/__stitched.img".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl DaemonConfig {
    /// Loads `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&text).map_err(|source| DaemonError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Configured fallback boot device.
    pub fn boot_device(&self) -> Result<BootDevice, DaemonError> {
        BootDevice::from_name(&self.boot_device)
            .ok_or_else(|| DaemonError::UnknownBootDevice(self.boot_device.clone()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn governor(&self) -> GovernorConfig {
        GovernorConfig {
            charger_loss_budget: self.charger_loss_budget,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            over_temperature: self.over_temperature,
            low_capacity_warning: self.low_capacity_warning,
        }
    }

    pub fn cos(&self) -> CosConfig {
        CosConfig {
            boot_hold: Duration::from_millis(self.boot_hold_ms),
            backlight_timeout: Duration::from_millis(self.backlight_timeout_ms),
        }
    }

    pub fn ifwi_channels(&self) -> IfwiChannels {
        IfwiChannels {
            dnx: self.paths.dnx_channel.clone(),
            ifwi: self.paths.ifwi_channel.clone(),
            prepare: self.paths.ifwi_prepare.clone(),
        }
    }

    /// Settings for the provisioning command set.
    pub fn provision(&self, removable_block: Option<u8>) -> ProvisionConfig {
        ProvisionConfig {
            product: self.product.clone(),
            force_cold_boot_path: self.paths.force_cold_boot.clone(),
            hsi_node: self.paths.hsi_node.clone(),
            ifwi: self.ifwi_channels(),
            removable_block,
        }
    }
}
