//! Provisioning commands served over fastboot.
//!
//! [`Provisioner`] is the pipeline context handed to every handler. It owns
//! the platform ports, the partition table and the few session settings the
//! host can change with `oem` commands.

pub mod flash;
mod oem;

pub use flash::{BootImageError, validate_boot_image};

use alloc::string::String;

use log::{error, info, warn};

use crate::fastboot::frame::MAX_RESPONSE_LEN;
use crate::fastboot::{AdmissionGate, CommandContext, Engine, Responder};
use crate::ota::ifwi::IfwiChannels;
use crate::ota::{InstallResult, OtaJob};
use crate::partition::volume;
use crate::partition::{BootDevice, PartitionTable};
use crate::platform::{Platform, PlatformError, RestartMode};
use crate::progress::ProgressReporter;

/// Written to request a cold boot on the next restart.
pub const FORCE_COLD_BOOT_PATH: &str = "/sys/module/intel_mid/parameters/force_cold_boot";
/// Bus node present when the modem HSI link is up.
pub const HSI_NODE: &str = "/sys/bus/hsi/devices/port0";
/// Brings up USB networking for NFS roots.
pub const RNDIS_ENABLE_COMMAND: &str = "echo 1 > /sys/class/usb_composite/rndis/enable;sleep 3";
/// Value published as `kernel`.
pub const KERNEL_NAME: &str = "droidboot";
/// Largest text carried by a single `INFO` frame.
pub const INFO_CHUNK_LEN: usize = MAX_RESPONSE_LEN - 4;

/// Where `flash:<partition>` extracts archives.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TarballOrigin {
    /// Archive paths are relative to `/mnt`.
    #[default]
    Root,
    /// Archive paths are relative to the partition mount point.
    MountPoint,
}

impl TarballOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TarballOrigin::Root => "root",
            TarballOrigin::MountPoint => "mount_point",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "root" => Some(TarballOrigin::Root),
            "mount_point" => Some(TarballOrigin::MountPoint),
            _ => None,
        }
    }
}

/// Static settings of the provisioning service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionConfig {
    pub product: String,
    pub force_cold_boot_path: String,
    pub hsi_node: String,
    pub ifwi: IfwiChannels,
    /// `mmcblk` number of the removable card, if one was detected.
    pub removable_block: Option<u8>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            product: String::from("mfld"),
            force_cold_boot_path: String::from(FORCE_COLD_BOOT_PATH),
            hsi_node: String::from(HSI_NODE),
            ifwi: IfwiChannels::default(),
            removable_block: None,
        }
    }
}

/// Pipeline context for the provisioning command set.
pub struct Provisioner<P> {
    platform: P,
    table: PartitionTable,
    config: ProvisionConfig,
    origin: TarballOrigin,
    log_enable: bool,
}

impl<P: Platform> Provisioner<P> {
    #[must_use]
    pub fn new(platform: P, table: PartitionTable, config: ProvisionConfig) -> Self {
        Self {
            platform,
            table,
            config,
            origin: TarballOrigin::Root,
            log_enable: false,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    pub const fn tarball_origin(&self) -> TarballOrigin {
        self.origin
    }

    /// Whether command output is streamed back as `INFO` frames.
    pub const fn log_enabled(&self) -> bool {
        self.log_enable
    }

    /// Registers the command set and publishes the provisioning variables.
    ///
    /// Registration order matters: later prefixes shadow earlier ones, so
    /// `reboot-bootloader` is registered after `reboot`.
    pub fn install<G: AdmissionGate>(&mut self, engine: &mut Engine<Self, G>) {
        engine.register("oem", oem::handle_oem::<P>);
        engine.register("reboot", handle_reboot::<P>);
        engine.register("reboot-bootloader", handle_reboot_bootloader::<P>);
        engine.register("erase:", handle_erase::<P>);
        engine.register("flash:", flash::handle_flash::<P>);
        engine.register("continue", handle_reboot::<P>);
        engine.register("boot", handle_reboot::<P>);

        let boot_device = self.table.boot_device();
        engine.publish("bootdev", boot_device.as_str());
        engine.publish("product", &self.config.product);
        engine.publish("kernel", KERNEL_NAME);
        engine.publish("tarball_origin", self.origin.as_str());

        if boot_device == BootDevice::Nfs && self.enable_rndis().is_err() {
            warn!("rndis unavailable for nfs boot device");
        }
    }

    /// Runs the persisted OTA request, if any, against this pipeline's
    /// partition table.
    pub fn run_pending_ota<R: ProgressReporter + ?Sized>(&mut self, progress: &mut R) -> InstallResult {
        OtaJob::new(&self.table, self.config.removable_block).run(&mut self.platform, progress)
    }

    /// Forces a cold boot, unmounts everything and restarts into the main OS.
    pub fn reboot_android(&mut self) {
        self.force_cold_boot();
        self.umount_all();
        self.platform.restart(RestartMode::Android);
    }

    fn enable_rndis(&mut self) -> Result<(), PlatformError> {
        match self.platform.run(RNDIS_ENABLE_COMMAND)? {
            0 => Ok(()),
            code => {
                error!("unable to enable rndis: exit {code}");
                Err(PlatformError::Os(code))
            }
        }
    }

    fn force_cold_boot(&mut self) {
        if let Err(err) = self
            .platform
            .write_file(&self.config.force_cold_boot_path, b"Y")
        {
            error!("cannot force cold boot: {err}");
        }
    }

    fn umount_all(&mut self) {
        if let Err(err) = volume::umount_all(&self.table, &mut self.platform) {
            warn!("umount before restart: {err}");
        }
    }
}

/// Sends `text` as consecutive `INFO` frames of at most [`INFO_CHUNK_LEN`]
/// bytes.
fn send_info_chunks(responder: &mut Responder<'_>, mut text: &str) {
    while !text.is_empty() {
        let mut end = text.len().min(INFO_CHUNK_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = text.split_at(end);
        responder.info(head);
        text = tail;
    }
}

/// Runs `command`, streaming its output as `INFO` frames while logging is
/// enabled.
fn logged_run<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    command: &str,
) -> Result<i32, PlatformError> {
    info!("start : {command}");
    let status = if ctx.pipeline.log_enable {
        send_info_chunks(&mut ctx.responder, command);
        let responder = &mut ctx.responder;
        ctx.pipeline
            .platform
            .run_streaming(command, &mut |chunk| send_info_chunks(responder, chunk))
    } else {
        ctx.pipeline.platform.run(command)
    };
    info!("{command} returns {status:?}");
    status
}

fn handle_reboot<P: Platform>(_: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    info!("Rebooting...");
    ctx.pipeline.force_cold_boot();
    ctx.okay("");
    ctx.pipeline.umount_all();
    ctx.pipeline.platform.restart(RestartMode::Android);
}

fn handle_reboot_bootloader<P: Platform>(_: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    info!("Rebooting to bootloader...");
    ctx.okay("");
    ctx.pipeline.umount_all();
    ctx.pipeline.platform.restart(RestartMode::Bootloader);
}

fn handle_erase<P: Platform>(name: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    info!("Erasing {name}.");
    let Provisioner {
        table, platform, ..
    } = &mut *ctx.pipeline;

    let Ok(entry) = table.find(name).copied() else {
        ctx.fail("unknown partition name");
        return;
    };

    if entry.name == "config" && volume::mount(table, &entry, platform).is_ok() {
        let _ = volume::umount(&entry, platform);
        ctx.okay("config volume already formated skipping...");
        return;
    }

    match volume::format(table, &entry, platform) {
        Ok(()) => ctx.okay(""),
        Err(err) => {
            error!("erase {}: {err}", entry.name);
            ctx.fail("failed to erase partition");
        }
    }
}
