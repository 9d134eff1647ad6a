//! Symbolic partition table and boot-device naming.
//!
//! Callers address partitions by name (`data`, `system`, `cache`, ...). The
//! table maps each name to a partition number and filesystem type, and the
//! active [`BootDevice`] turns that number into a concrete device path.

pub mod volume;

use alloc::format;
use alloc::string::String;
use core::fmt;

/// Root directory under which every partition is mounted.
pub const MOUNT_ROOT: &str = "/mnt";

/// Alias accepted for the `data` partition.
pub const USERDATA_ALIAS: &str = "userdata";

/// Storage class the partitions live on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootDevice {
    /// Primary eMMC (`mmcblk0`).
    Sdcard,
    /// Secondary eMMC (`mmcblk1`).
    Sdcard1,
    /// Tertiary eMMC (`mmcblk2`).
    Sdcard2,
    /// Raw NAND.
    Nand,
    /// USB mass storage.
    Usb,
    /// NFS export reached over RNDIS.
    Nfs,
}

impl BootDevice {
    /// Canonical name published as the `bootdev` variable.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BootDevice::Sdcard => "sdcard",
            BootDevice::Sdcard1 => "sdcard1",
            BootDevice::Sdcard2 => "sdcard2",
            BootDevice::Nand => "nand",
            BootDevice::Usb => "usb",
            BootDevice::Nfs => "nfs",
        }
    }

    /// Parses a boot device name, accepting the short `sd*` aliases.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sd" | "sdcard" => Some(BootDevice::Sdcard),
            "sd1" | "sdcard1" => Some(BootDevice::Sdcard1),
            "sd2" | "sdcard2" => Some(BootDevice::Sdcard2),
            "nand" => Some(BootDevice::Nand),
            "usb" => Some(BootDevice::Usb),
            "nfs" => Some(BootDevice::Nfs),
            _ => None,
        }
    }

    /// Maps the eMMC block number of the boot medium to a device class.
    #[must_use]
    pub const fn from_emmc_block(block: u32) -> Option<Self> {
        match block {
            0 => Some(BootDevice::Sdcard),
            1 => Some(BootDevice::Sdcard1),
            2 => Some(BootDevice::Sdcard2),
            _ => None,
        }
    }

    /// Returns `true` for the network-backed class.
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(self, BootDevice::Nfs)
    }

    /// Device path (or NFS mount source) of partition `number`.
    #[must_use]
    pub fn device_path(self, number: u8) -> String {
        match self {
            BootDevice::Sdcard => format!("/dev/mmcblk0p{number}"),
            BootDevice::Sdcard1 => format!("/dev/mmcblk1p{number}"),
            BootDevice::Sdcard2 => format!("/dev/mmcblk2p{number}"),
            BootDevice::Nand => format!("/dev/nda{number}"),
            BootDevice::Usb => format!("/dev/sda{number}"),
            BootDevice::Nfs => format!("-o nolock 50.0.0.1:/android/nfs{number}"),
        }
    }
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem driver used for a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsType {
    Ext3,
    Ext4,
    Vfat,
    Nfs,
}

impl FsType {
    /// Name passed to `mount` and used as the `mkfs.<fs>` suffix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Vfat => "vfat",
            FsType::Nfs => "nfs",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the static partition table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartitionEntry {
    pub name: &'static str,
    pub number: u8,
    pub fs_type: FsType,
}

impl PartitionEntry {
    /// Builds a table row.
    #[must_use]
    pub const fn new(name: &'static str, number: u8, fs_type: FsType) -> Self {
        Self {
            name,
            number,
            fs_type,
        }
    }

    /// Directory the partition is mounted on.
    #[must_use]
    pub fn mount_point(&self) -> String {
        format!("{MOUNT_ROOT}/{}", self.name)
    }
}

/// Stock partition layout of the provisioning image.
pub const DEFAULT_LAYOUT: [PartitionEntry; 8] = [
    PartitionEntry::new("factory", 1, FsType::Ext4),
    PartitionEntry::new("data", 2, FsType::Ext4),
    PartitionEntry::new("sdcard", 3, FsType::Vfat),
    PartitionEntry::new("recovery", 5, FsType::Ext4),
    PartitionEntry::new("system", 6, FsType::Ext4),
    PartitionEntry::new("cache", 7, FsType::Ext4),
    PartitionEntry::new("config", 8, FsType::Ext4),
    PartitionEntry::new("ilog", 10, FsType::Ext4),
];

/// Errors raised by partition lookups.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionError {
    /// No table row matches the requested name.
    UnknownPartition,
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionError::UnknownPartition => f.write_str("unknown partition name"),
        }
    }
}

impl core::error::Error for PartitionError {}

/// Partition table bound to the active boot device.
///
/// The rows are fixed after construction; only the boot device class may
/// change (through `oem bootdev`).
#[derive(Clone, Debug)]
pub struct PartitionTable {
    entries: &'static [PartitionEntry],
    boot_device: BootDevice,
}

impl PartitionTable {
    /// Creates a table over `entries` targeting `boot_device`.
    #[must_use]
    pub const fn new(entries: &'static [PartitionEntry], boot_device: BootDevice) -> Self {
        Self {
            entries,
            boot_device,
        }
    }

    /// Creates the stock table targeting `boot_device`.
    #[must_use]
    pub const fn with_default_layout(boot_device: BootDevice) -> Self {
        Self::new(&DEFAULT_LAYOUT, boot_device)
    }

    /// Active boot device class.
    #[must_use]
    pub const fn boot_device(&self) -> BootDevice {
        self.boot_device
    }

    /// Switches the boot device class.
    pub fn set_boot_device(&mut self, boot_device: BootDevice) {
        self.boot_device = boot_device;
    }

    /// Iterates the table rows in order.
    pub fn entries(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter()
    }

    /// Resolves `name` to the first row whose name prefixes it.
    ///
    /// `userdata` resolves to the `data` row.
    pub fn find(&self, name: &str) -> Result<&PartitionEntry, PartitionError> {
        let name = if name == USERDATA_ALIAS { "data" } else { name };
        self.entries
            .iter()
            .find(|entry| name.starts_with(entry.name))
            .ok_or(PartitionError::UnknownPartition)
    }

    /// Device path of `entry` on the active boot device.
    #[must_use]
    pub fn device_path(&self, entry: &PartitionEntry) -> String {
        self.boot_device.device_path(entry.number)
    }

    /// Filesystem type of `entry`, forced to NFS on the network class.
    #[must_use]
    pub fn fs_type(&self, entry: &PartitionEntry) -> FsType {
        if self.boot_device.is_network() {
            FsType::Nfs
        } else {
            entry.fs_type
        }
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::with_default_layout(BootDevice::Sdcard)
    }
}
