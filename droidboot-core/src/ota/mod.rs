//! Persisted OTA job: factory restore, data wipe and package install.
//!
//! The job is described by a command file left in the cache partition, one
//! `--option[=value]` per line. Whatever happens, a finished job leaves a
//! result intent in the data partition and removes the command file so the
//! next boot does not replay it.

pub mod ifwi;

use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;

use log::{error, info, warn};
use winnow::ModalResult;
use winnow::combinator::{opt, preceded};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::boot::PowerOnReason;
use crate::partition::PartitionTable;
use crate::partition::volume::{self, VolumeError, VolumePorts, run_checked};
use crate::platform::{ControlDevice, PlatformError, tolerate_existing};
use crate::progress::{ProgressMarker, ProgressReporter};

/// Directory holding the command file and the wipe marker.
pub const RECOVERY_DIR: &str = "/mnt/cache/recovery";
/// Job description written by the main OS or the provisioning host.
pub const COMMAND_FILE: &str = "/mnt/cache/recovery/command";
/// Present once the destructive wipe of the running job completed.
pub const WIPE_MARKER: &str = "/mnt/cache/recovery/schedule";
/// Directory receiving the result intent.
pub const INTENT_DIR: &str = "/mnt/data/recovery";
/// Result intent read by the main OS after reboot.
pub const INTENT_FILE: &str = "/mnt/data/recovery/upgrade_success";
/// Loop mount point of the package being installed.
pub const PACKAGE_MOUNT: &str = "/update";
/// System archive shipped inside a full package.
pub const SYSTEM_TARBALL: &str = "/update/android/system/system.tar.gz";
/// Factory image replayed by a factory restore.
pub const RESTORE_IMAGE: &str = "/mnt/factory/factory_restore.iso";
/// Mount point of the removable card.
pub const SDCARD_MOUNT: &str = "/mnt/sdcard";
/// Rewrites the firmware partition table entries after an update.
pub const RESTORE_OSIP_COMMAND: &str = "update_osip --restore";

const VERIFY_COMMAND: &str = "/chaabi/signed_image_verify.out -f";
const SETUP_COMMAND: &str = "/bin/sh /update/setup.sh";

/// Outcome persisted for the next boot stage.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstallResult {
    Success,
    Error,
    /// The package failed signature verification.
    Corrupt,
    /// No command file was found.
    Interrupt,
    /// The command file asked for nothing actionable.
    Abort,
}

/// Package flavour named by `--type`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PackageType {
    Ota,
    Fota,
    Other(String),
}

impl PackageType {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "ota" => PackageType::Ota,
            "fota" => PackageType::Fota,
            other => PackageType::Other(other.to_string()),
        }
    }
}

/// Options recognised in the command file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OtaArgs {
    pub update_package: Option<String>,
    pub package_type: Option<String>,
    pub sdcard: bool,
    pub wipe_data: bool,
    pub factory_restore: bool,
}

fn option_line<'a>(input: &mut &'a str) -> ModalResult<(&'a str, Option<&'a str>), ContextError> {
    preceded("--", (take_till(1.., '='), opt(preceded('=', rest)))).parse_next(input)
}

impl OtaArgs {
    /// Parses a command file. Unknown options and stray lines are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut args = Self::default();
        for line in text.lines().map(str::trim) {
            let Ok((name, value)) = option_line.parse(line) else {
                continue;
            };
            match (name, value) {
                ("update_package", Some(path)) => args.update_package = Some(path.to_string()),
                ("type", Some(kind)) => args.package_type = Some(kind.to_string()),
                ("sdcard", _) => args.sdcard = true,
                ("wipe_data", _) => args.wipe_data = true,
                ("factory_restore", _) => args.factory_restore = true,
                _ => warn!("ignoring OTA option {line}"),
            }
        }
        args
    }

    /// Picks the single action to run: factory restore, then data wipe, then
    /// package install.
    #[must_use]
    pub fn request(&self) -> OtaRequest {
        if self.factory_restore {
            return OtaRequest::FactoryRestore;
        }
        if self.wipe_data {
            return OtaRequest::WipeData;
        }
        match (&self.update_package, &self.package_type) {
            (Some(package), Some(kind)) => OtaRequest::Install {
                package: package.clone(),
                kind: PackageType::from_name(kind),
                sdcard: self.sdcard,
            },
            _ => OtaRequest::Nothing,
        }
    }

    /// Serialises the options back into command file form.
    #[must_use]
    pub fn to_command_file(&self) -> String {
        let mut text = String::new();
        if let Some(package) = &self.update_package {
            text.push_str(&format!("--update_package={package}\n"));
        }
        if let Some(kind) = &self.package_type {
            text.push_str(&format!("--type={kind}\n"));
        }
        for (set, flag) in [
            (self.sdcard, "--sdcard\n"),
            (self.wipe_data, "--wipe_data\n"),
            (self.factory_restore, "--factory_restore\n"),
        ] {
            if set {
                text.push_str(flag);
            }
        }
        text
    }
}

/// Action selected from [`OtaArgs`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OtaRequest {
    FactoryRestore,
    WipeData,
    Install {
        package: String,
        kind: PackageType,
        sdcard: bool,
    },
    Nothing,
}

/// Errors raised by an OTA step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OtaError {
    /// Neither a wipe, a restore nor a complete install was requested.
    NothingToDo,
    UnsupportedType(String),
    /// `--sdcard` was given but no removable card was detected.
    SdcardUnavailable,
    SdcardMount(PlatformError),
    Verification(VolumeError),
    PackageMount(VolumeError),
    Volume(VolumeError),
    Setup(VolumeError),
    Restore(VolumeError),
    Platform(PlatformError),
}

impl OtaError {
    /// Short reason stored in the result intent.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            OtaError::NothingToDo => "nothing to install",
            OtaError::UnsupportedType(_) => "unsupported package type",
            OtaError::SdcardUnavailable | OtaError::SdcardMount(_) => "sdcard unavailable",
            OtaError::Verification(_) => "package verification failed",
            OtaError::PackageMount(_) => "fail to mount package",
            OtaError::Volume(_) => "fail to erase partitions",
            OtaError::Setup(_) => "setup script failed",
            OtaError::Restore(_) => "osip restore failed",
            OtaError::Platform(_) => "fail to update",
        }
    }

    /// Result code matching this failure.
    #[must_use]
    pub const fn install_result(&self) -> InstallResult {
        match self {
            OtaError::NothingToDo => InstallResult::Abort,
            OtaError::Verification(_) => InstallResult::Corrupt,
            _ => InstallResult::Error,
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::UnsupportedType(kind) => write!(f, "unsupported package type {kind}"),
            OtaError::SdcardMount(err) | OtaError::Platform(err) => {
                write!(f, "{}: {err}", self.reason())
            }
            OtaError::Verification(err)
            | OtaError::PackageMount(err)
            | OtaError::Volume(err)
            | OtaError::Setup(err)
            | OtaError::Restore(err) => write!(f, "{}: {err}", self.reason()),
            OtaError::NothingToDo | OtaError::SdcardUnavailable => f.write_str(self.reason()),
        }
    }
}

impl core::error::Error for OtaError {}

impl From<VolumeError> for OtaError {
    fn from(value: VolumeError) -> Self {
        OtaError::Volume(value)
    }
}

/// Ports used by the job.
pub trait OtaPorts: VolumePorts + ControlDevice {}

impl<T: VolumePorts + ControlDevice + ?Sized> OtaPorts for T {}

/// Result intent text for `outcome`.
#[must_use]
pub fn intent_text(outcome: &Result<(), OtaError>) -> String {
    match outcome {
        Ok(()) => "--result=success".to_string(),
        Err(err) => format!("--result=fail\n--extra={}", err.reason()),
    }
}

/// Writes `args` as the pending job. The cache partition must be mounted.
pub fn write_command_file<P: VolumePorts + ?Sized>(
    ports: &mut P,
    args: &OtaArgs,
) -> Result<(), PlatformError> {
    tolerate_existing(ports.create_dir(RECOVERY_DIR))?;
    ports.write_file(COMMAND_FILE, args.to_command_file().as_bytes())
}

/// Runs OTA requests against a partition table.
pub struct OtaJob<'a> {
    table: &'a PartitionTable,
    removable_block: Option<u8>,
}

impl<'a> OtaJob<'a> {
    /// `removable_block` is the `mmcblk` number of the removable card, if one
    /// was detected.
    #[must_use]
    pub const fn new(table: &'a PartitionTable, removable_block: Option<u8>) -> Self {
        Self {
            table,
            removable_block,
        }
    }

    /// Runs the job described by the command file and finalises it.
    ///
    /// A missing command file yields [`InstallResult::Interrupt`] and leaves
    /// no intent behind.
    pub fn run<P, R>(&self, ports: &mut P, progress: &mut R) -> InstallResult
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        if let Err(err) = volume::mount_by_name(self.table, "cache", ports) {
            warn!("cache mount before OTA: {err}");
        }
        let text = match ports.read_file(COMMAND_FILE) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                info!("no OTA command: {err}");
                progress.message("OTA command not found...");
                let _ = volume::umount_by_name(self.table, "cache", ports);
                return InstallResult::Interrupt;
            }
        };
        let request = OtaArgs::parse(&text).request();
        info!("OTA request: {request:?}");

        progress.marker(ProgressMarker::Start);
        let outcome = self.execute(&request, ports, progress);
        progress.marker(ProgressMarker::Finish);

        match &outcome {
            Ok(()) => progress.message("complete...\nupdate success"),
            Err(err) => {
                error!("OTA failed: {err}");
                progress.message("update error");
            }
        }
        self.finish(&outcome, ports);
        outcome
            .as_ref()
            .map_or_else(OtaError::install_result, |_| InstallResult::Success)
    }

    /// Executes a single request. Expects the cache partition to be mounted.
    pub fn execute<P, R>(
        &self,
        request: &OtaRequest,
        ports: &mut P,
        progress: &mut R,
    ) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        match request {
            OtaRequest::FactoryRestore => self.factory_restore(ports, progress),
            OtaRequest::WipeData => self.wipe_data(ports, progress),
            OtaRequest::Install {
                package,
                kind,
                sdcard,
            } => self.install_package(package, kind, *sdcard, ports, progress),
            OtaRequest::Nothing => Err(OtaError::NothingToDo),
        }
    }

    fn factory_restore<P, R>(&self, ports: &mut P, progress: &mut R) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        volume::mount_by_name(self.table, "factory", ports)?;
        progress.message("mount factory");
        mount_package(RESTORE_IMAGE, ports)?;
        progress.message("mount package");
        let result = self
            .wipe_partitions(ports, progress)
            .and_then(|()| self.run_setup(ports, progress));
        release_package(ports);
        let _ = volume::umount_by_name(self.table, "factory", ports);
        result
    }

    fn wipe_data<P, R>(&self, ports: &mut P, progress: &mut R) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        self.wipe_partitions(ports, progress)?;
        run_checked(ports, RESTORE_OSIP_COMMAND).map_err(OtaError::Restore)?;
        if let Err(err) = ports.write_power_on_reason(PowerOnReason::MainOs.code()) {
            error!("unable to record power-on reason: {err}");
        }
        Ok(())
    }

    fn install_package<P, R>(
        &self,
        package: &str,
        kind: &PackageType,
        sdcard: bool,
        ports: &mut P,
        progress: &mut R,
    ) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        match kind {
            PackageType::Ota => {}
            PackageType::Fota => {
                info!("fota package accepted, nothing to install");
                return Ok(());
            }
            PackageType::Other(name) => return Err(OtaError::UnsupportedType(name.clone())),
        }

        if sdcard {
            let block = self.removable_block.ok_or(OtaError::SdcardUnavailable)?;
            tolerate_existing(ports.create_dir(SDCARD_MOUNT)).map_err(OtaError::SdcardMount)?;
            ports
                .mount(&format!("/dev/mmcblk{block}p1"), SDCARD_MOUNT, "vfat")
                .map_err(OtaError::SdcardMount)?;
            let result = self.install_ota(package, ports, progress);
            if let Err(err) = ports.umount(SDCARD_MOUNT) {
                warn!("umount {SDCARD_MOUNT}: {err}");
            }
            result
        } else {
            if let Err(err) = volume::mount_by_name(self.table, "sdcard", ports) {
                warn!("sdcard partition not mounted: {err}");
            }
            let result = self.install_ota(package, ports, progress);
            let _ = volume::umount_by_name(self.table, "sdcard", ports);
            result
        }
    }

    /// Verifies, mounts and installs an OTA package.
    pub fn install_ota<P, R>(
        &self,
        package: &str,
        ports: &mut P,
        progress: &mut R,
    ) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        run_checked(ports, &format!("{VERIFY_COMMAND} {package}")).map_err(|err| {
            progress.message("package verification failed");
            OtaError::Verification(err)
        })?;
        mount_package(package, ports)?;
        let result = self
            .wipe_partitions(ports, progress)
            .and_then(|()| self.run_setup(ports, progress));
        release_package(ports);
        result
    }

    /// Erases data, and system when the package ships a system archive.
    ///
    /// The wipe marker records completion, so a retried job does not erase
    /// the partitions a second time.
    pub fn wipe_partitions<P, R>(&self, ports: &mut P, progress: &mut R) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        if ports.exists(WIPE_MARKER) {
            progress.message("update log file has found.");
            return Ok(());
        }
        progress.message("clean user data.");
        volume::erase(self.table, "data", ports)?;
        if ports.exists(SYSTEM_TARBALL) {
            volume::erase(self.table, "system", ports)?;
        } else {
            progress.message("system image not found.");
        }
        tolerate_existing(ports.create_dir(RECOVERY_DIR)).map_err(OtaError::Platform)?;
        ports
            .write_file(WIPE_MARKER, b"")
            .map_err(OtaError::Platform)
    }

    fn run_setup<P, R>(&self, ports: &mut P, progress: &mut R) -> Result<(), OtaError>
    where
        P: OtaPorts + ?Sized,
        R: ProgressReporter + ?Sized,
    {
        volume::mount_by_name(self.table, "system", ports).map_err(OtaError::Setup)?;
        progress.message(&format!("run command: {SETUP_COMMAND}"));
        let result = run_checked(ports, SETUP_COMMAND).map_err(OtaError::Setup);
        let _ = volume::umount_by_name(self.table, "system", ports);
        result
    }

    /// Persists the result intent and removes the job files. Every step is
    /// attempted even when an earlier one fails.
    pub fn finish<P: OtaPorts + ?Sized>(&self, outcome: &Result<(), OtaError>, ports: &mut P) {
        let intent = intent_text(outcome);
        match volume::mount_by_name(self.table, "data", ports) {
            Ok(_) => {
                let written = tolerate_existing(ports.create_dir(INTENT_DIR))
                    .and_then(|()| ports.write_file(INTENT_FILE, intent.as_bytes()));
                if let Err(err) = written {
                    error!("can't create {INTENT_FILE}: {err}");
                }
            }
            Err(err) => error!("unable to mount data for the intent: {err}"),
        }
        let _ = volume::umount_by_name(self.table, "data", ports);

        for path in [COMMAND_FILE, WIPE_MARKER] {
            match ports.remove_file(path) {
                Ok(()) | Err(PlatformError::NotFound) => {}
                Err(err) => warn!("unable to remove {path}: {err}"),
            }
        }
        let _ = volume::umount_by_name(self.table, "cache", ports);

        if let Err(err) = run_checked(ports, RESTORE_OSIP_COMMAND) {
            warn!("{RESTORE_OSIP_COMMAND}: {err}");
        }
    }
}

fn mount_package<P: OtaPorts + ?Sized>(image: &str, ports: &mut P) -> Result<(), OtaError> {
    tolerate_existing(ports.create_dir(PACKAGE_MOUNT))
        .map_err(|err| OtaError::PackageMount(VolumeError::MountPoint(err)))?;
    run_checked(
        ports,
        &format!("mount {image} {PACKAGE_MOUNT} -t iso9660 -o loop"),
    )
    .map_err(OtaError::PackageMount)
}

fn release_package<P: OtaPorts + ?Sized>(ports: &mut P) {
    match ports.umount(PACKAGE_MOUNT) {
        Ok(()) | Err(PlatformError::NotMounted | PlatformError::NotFound) => {}
        Err(err) => warn!("umount {PACKAGE_MOUNT}: {err}"),
    }
}
