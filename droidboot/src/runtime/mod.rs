//! Thread wiring behind each daemon subcommand.
//!
//! The power governor and its event consumer run on their own threads and
//! talk to the rest of the daemon through [`POWER_EVENTS`], the shared
//! low-power flag and [`crate::status`]. Key presses reach the charge loop
//! through [`KEY_EVENTS`]. The fastboot listener runs on the calling thread.

use std::fs;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use droidboot_core::boot::{self, BootStage, PowerOnReason};
use droidboot_core::fastboot::AlwaysAdmit;
use droidboot_core::ota::InstallResult;
use droidboot_core::ota::ifwi::{self, IfwiOutcome};
use droidboot_core::partition::{BootDevice, PartitionTable};
use droidboot_core::platform::{PowerControl, PropertyStore};
use droidboot_core::power::{self, LowPowerFlag, PowerEventChannel, VoltageGate};
use droidboot_core::provision::Provisioner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::pubsub::PubSubChannel;
use log::{error, info, warn};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::hw::input::KeyChannel;
use crate::hw::power::SysfsPowerReader;
use crate::hw::{LinuxPlatform, Reboot, mmc};
use crate::progress::ProgressFile;

mod charge_task;
mod fastboot_task;
mod governor_task;

pub(crate) static POWER_EVENTS: PowerEventChannel<CriticalSectionRawMutex> = PubSubChannel::new();
pub(crate) static KEY_EVENTS: KeyChannel = Channel::new();

const RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Charge loop flavour selected on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ChargeMode {
    /// Charge-only: the power key boots the main OS.
    Cos,
    /// Provisioning: wait for the voltage gate, then exit.
    Pos,
}

/// Boot device from the eMMC block number, else the configured default.
fn detect_boot_device(config: &DaemonConfig) -> Result<BootDevice, DaemonError> {
    let detected = mmc::block_number(&config.paths.emmc_entry)
        .and_then(|block| BootDevice::from_emmc_block(u32::from(block)));
    match detected {
        Some(device) => Ok(device),
        None => {
            warn!("Get eMMC's blk number error!");
            config.boot_device()
        }
    }
}

fn provisioner(
    config: &DaemonConfig,
    platform: LinuxPlatform,
    table: PartitionTable,
) -> Provisioner<LinuxPlatform> {
    let removable = mmc::block_number(&config.paths.sdcard_entry);
    Provisioner::new(platform, table, config.provision(removable))
}

/// Discovers the supplies and reads the gate. Missing supplies power the
/// device off.
fn power_inputs(
    config: &DaemonConfig,
    platform: &mut LinuxPlatform,
) -> Result<(SysfsPowerReader, VoltageGate), DaemonError> {
    let reader = match SysfsPowerReader::discover(&config.paths.power_supply_root) {
        Ok(reader) => reader,
        Err(err) => {
            error!("{err}, shutting down");
            platform.power_off();
            return Err(err);
        }
    };
    Ok((reader, VoltageGate::read(platform)))
}

fn spawn_governor(
    config: &DaemonConfig,
    gate: VoltageGate,
    reader: SysfsPowerReader,
) -> Result<Arc<LowPowerFlag>, DaemonError> {
    governor_task::spawn(
        config.governor(),
        gate,
        reader,
        Reboot::new(config.paths.force_shutdown.clone()),
        config.poll_interval(),
    )
}

fn exec_recovery(config: &DaemonConfig, platform: &mut LinuxPlatform) -> DaemonError {
    if let Err(err) = platform.set_property("ro.debuggable", "0") {
        warn!("unable to clear ro.debuggable: {err}");
    }
    thread::sleep(RECOVERY_DELAY);
    let err = Command::new(&config.paths.recovery_binary).exec();
    error!("SWITCH TO RECOVERY FAILED!");
    DaemonError::Recovery(err)
}

/// Firmware and product lines shown at start-up.
pub fn info(config: &DaemonConfig) -> Vec<String> {
    let mut platform = LinuxPlatform::from_config(config);
    let properties = fs::read_to_string(&config.paths.default_prop)
        .map_err(|err| warn!("{}: {err}", config.paths.default_prop.display()))
        .ok();
    boot::info_lines(&mut platform, properties.as_deref())
}

/// Full start-up: picks the boot stage, charges when needed, then runs the
/// OTA trigger and the fastboot listener.
pub fn boot(config: &DaemonConfig) -> Result<(), DaemonError> {
    let mut platform = LinuxPlatform::from_config(config);
    let table = PartitionTable::with_default_layout(detect_boot_device(config)?);
    boot::enable_log_partition(&table, &mut platform);
    if let Some(product) = info(config).last() {
        info!("{product}");
    }

    let reason = PowerOnReason::read(&mut platform);
    let (mut reader, gate) = power_inputs(config, &mut platform)?;
    let stage = boot::select_stage(reason, power::can_boot(&mut reader, gate));
    info!("power-on reason {reason:?}, stage {stage:?}");

    match stage {
        BootStage::Recovery => return Err(exec_recovery(config, &mut platform)),
        BootStage::ChargeOnly => {
            spawn_governor(config, gate, reader.clone())?;
            charge_task::run_cos(config, config.cos(), gate, &mut reader, &mut platform);
            return Ok(());
        }
        BootStage::ChargeThenProvision | BootStage::Provision => {}
    }

    let low_power = spawn_governor(config, gate, reader.clone())?;
    if stage == BootStage::ChargeThenProvision {
        if let Err(err) = charge_task::run_pos(gate, &mut reader, config.poll_interval()) {
            error!("CHARGING ERROR, SHUTDOWN!");
            thread::sleep(config.governor().shutdown_grace);
            platform.power_off();
            return Err(err);
        }
    }

    let mut provisioner = provisioner(config, platform, table);
    if fastboot_task::trigger_ota(config, &mut provisioner) {
        return Ok(());
    }
    fastboot_task::serve(config, provisioner, low_power);
    Ok(())
}

/// Serves fastboot without power supervision.
pub fn fastboot(config: &DaemonConfig) -> Result<(), DaemonError> {
    let platform = LinuxPlatform::from_config(config);
    let table = PartitionTable::with_default_layout(detect_boot_device(config)?);
    fastboot_task::serve(config, provisioner(config, platform, table), AlwaysAdmit);
    Ok(())
}

/// Runs the persisted OTA job once without restarting.
pub fn ota(config: &DaemonConfig) -> Result<InstallResult, DaemonError> {
    let platform = LinuxPlatform::from_config(config);
    let table = PartitionTable::with_default_layout(detect_boot_device(config)?);
    let mut progress = ProgressFile::new(config.paths.progress_file.clone());
    Ok(provisioner(config, platform, table).run_pending_ota(&mut progress))
}

/// Runs one of the charge loops with the governor active.
pub fn charge(config: &DaemonConfig, mode: ChargeMode) -> Result<(), DaemonError> {
    let mut platform = LinuxPlatform::from_config(config);
    let (mut reader, gate) = power_inputs(config, &mut platform)?;
    spawn_governor(config, gate, reader.clone())?;
    match mode {
        ChargeMode::Cos => {
            charge_task::run_cos(config, config.cos(), gate, &mut reader, &mut platform);
            Ok(())
        }
        ChargeMode::Pos => charge_task::run_pos(gate, &mut reader, config.poll_interval()),
    }
}

/// Stages a DnX/IFWI pair through the SCU channels.
pub fn ifwi(config: &DaemonConfig, dnx: &str, image: &str) -> Result<IfwiOutcome, DaemonError> {
    let mut platform = LinuxPlatform::from_config(config);
    Ok(ifwi::update(&mut platform, dnx, image, &config.ifwi_channels())?)
}
