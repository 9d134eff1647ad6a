//! Capability ports consumed by the control plane.
//!
//! Every interaction with the outside world (shell commands, files, mounts,
//! the firmware control device, the boot image stitcher, system properties and
//! power management) goes through one of the traits below. The daemon wires
//! them to the real kernel interfaces, while the emulator and the test suites
//! provide in-memory doubles so the decision logic can be exercised without
//! touching a device.

use alloc::vec::Vec;
use core::fmt;

/// Failure reported by a platform port.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlatformError {
    /// The path or device does not exist.
    NotFound,
    /// The path already exists.
    AlreadyExists,
    /// The target is not currently mounted.
    NotMounted,
    /// The port does not implement the requested operation.
    Unsupported,
    /// Raw OS error number reported by the kernel.
    Os(i32),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NotFound => f.write_str("not found"),
            PlatformError::AlreadyExists => f.write_str("already exists"),
            PlatformError::NotMounted => f.write_str("not mounted"),
            PlatformError::Unsupported => f.write_str("unsupported"),
            PlatformError::Os(code) => write!(f, "os error {code}"),
        }
    }
}

impl core::error::Error for PlatformError {}

/// Runs shell command lines on behalf of the pipeline.
pub trait ProcessRunner {
    /// Runs `command` to completion and returns its exit code.
    fn run(&mut self, command: &str) -> Result<i32, PlatformError>;

    /// Runs `command`, forwarding its combined output to `sink` in chunks.
    ///
    /// The default implementation discards output.
    fn run_streaming(
        &mut self,
        command: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<i32, PlatformError> {
        let _ = sink;
        self.run(command)
    }
}

/// Minimal file access used by the pipeline.
pub trait Filesystem {
    /// Creates or truncates `path` and writes `data` to it.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), PlatformError>;

    /// Reads the complete contents of `path`.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, PlatformError>;

    /// Returns `true` when `path` exists.
    fn exists(&self, path: &str) -> bool;

    /// Removes the file at `path`.
    fn remove_file(&mut self, path: &str) -> Result<(), PlatformError>;

    /// Creates a single directory. Reports [`PlatformError::AlreadyExists`]
    /// when it is already present.
    fn create_dir(&mut self, path: &str) -> Result<(), PlatformError>;

    /// Returns the size of the file at `path` in bytes.
    fn file_len(&self, path: &str) -> Result<u64, PlatformError>;

    /// Copies `from` into `to`.
    fn copy_file(&mut self, from: &str, to: &str) -> Result<u64, PlatformError> {
        let data = self.read_file(from)?;
        self.write_file(to, &data)?;
        Ok(data.len() as u64)
    }
}

/// Block device mount primitives.
pub trait Mounter {
    /// Mounts `device` on `target` using the `fs_type` driver.
    fn mount(&mut self, device: &str, target: &str, fs_type: &str) -> Result<(), PlatformError>;

    /// Unmounts `target`. Reports [`PlatformError::NotMounted`] when nothing
    /// is mounted there.
    fn umount(&mut self, target: &str) -> Result<(), PlatformError>;
}

/// Length of the firmware revision record returned by the control device.
pub const FW_REVISION_LEN: usize = 16;

/// Calibration and boot-reason storage exposed by the platform controller.
pub trait ControlDevice {
    /// Reads the raw VBATTCRIT calibration word.
    fn read_vbattcrit(&mut self) -> Result<u32, PlatformError>;

    /// Reads the raw power-on reason recorded for this boot.
    fn read_power_on_reason(&mut self) -> Result<u8, PlatformError>;

    /// Records the power-on reason the next boot stage should act on.
    fn write_power_on_reason(&mut self, reason: u8) -> Result<(), PlatformError>;

    /// Reads the firmware revision record.
    fn read_fw_revision(&mut self) -> Result<[u8; FW_REVISION_LEN], PlatformError>;
}

/// OS image slot targeted by the stitching primitive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootSlot {
    /// Main OS image.
    Main,
    /// Recovery image.
    Recovery,
}

impl BootSlot {
    /// Index understood by the stitching tool.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            BootSlot::Main => 0,
            BootSlot::Recovery => 1,
        }
    }
}

/// Writes composite boot images into their firmware slots.
pub trait BootImageWriter {
    /// Stitches `image` into `slot`.
    fn write_boot_image(&mut self, image: &[u8], slot: BootSlot) -> Result<(), PlatformError>;

    /// Restores the payload entry after the main slot has been rewritten.
    fn restore_payload_entry(&mut self) -> Result<(), PlatformError>;
}

/// System property writes.
pub trait PropertyStore {
    /// Sets `key` to `value`.
    fn set_property(&mut self, key: &str, value: &str) -> Result<(), PlatformError>;
}

/// Target requested when restarting the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartMode {
    /// Boot the main OS.
    Android,
    /// Boot back into the provisioning OS.
    Bootloader,
    /// Boot the recovery image.
    Recovery,
}

impl RestartMode {
    /// Argument passed to the kernel restart call.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RestartMode::Android => "android",
            RestartMode::Bootloader => "bootloader",
            RestartMode::Recovery => "recovery",
        }
    }
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Irreversible power transitions.
pub trait PowerControl {
    /// Powers the device off.
    fn power_off(&mut self);

    /// Restarts the device into `mode`.
    fn restart(&mut self, mode: RestartMode);
}

/// Power control that only records requests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordingPowerControl {
    power_offs: usize,
    restarts: Vec<RestartMode>,
}

impl RecordingPowerControl {
    /// Creates a recorder with no requests.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            power_offs: 0,
            restarts: Vec::new(),
        }
    }

    /// Number of power-off requests seen.
    #[must_use]
    pub const fn power_offs(&self) -> usize {
        self.power_offs
    }

    /// Restart requests in the order they were issued.
    #[must_use]
    pub fn restarts(&self) -> &[RestartMode] {
        &self.restarts
    }
}

impl PowerControl for RecordingPowerControl {
    fn power_off(&mut self) {
        self.power_offs += 1;
    }

    fn restart(&mut self, mode: RestartMode) {
        self.restarts.push(mode);
    }
}

/// Aggregate of every port the provisioning pipeline needs.
pub trait Platform:
    ProcessRunner + Filesystem + Mounter + ControlDevice + BootImageWriter + PropertyStore + PowerControl
{
}

impl<T> Platform for T where
    T: ProcessRunner
        + Filesystem
        + Mounter
        + ControlDevice
        + BootImageWriter
        + PropertyStore
        + PowerControl
{
}

/// Returns `Ok(())` when `result` failed only because the directory exists.
pub fn tolerate_existing(result: Result<(), PlatformError>) -> Result<(), PlatformError> {
    match result {
        Err(PlatformError::AlreadyExists) => Ok(()),
        other => other,
    }
}
