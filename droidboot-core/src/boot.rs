//! Boot stage selection and device information.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::{error, info, warn};
use winnow::ModalResult;
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::partition::PartitionTable;
use crate::partition::volume::{self, VolumePorts};
use crate::platform::{ControlDevice, FW_REVISION_LEN, PropertyStore};

/// Reason code stored by the platform controller across resets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerOnReason {
    /// Boot the main OS.
    MainOs,
    /// Charge-only mode (charger inserted while off).
    ChargeOnly,
    /// Provisioning OS.
    Provisioning,
    /// Recovery image.
    Recovery,
}

impl PowerOnReason {
    /// Decodes a raw reason; unknown codes select provisioning.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => PowerOnReason::MainOs,
            0x0a => PowerOnReason::ChargeOnly,
            0x0c => PowerOnReason::Recovery,
            _ => PowerOnReason::Provisioning,
        }
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            PowerOnReason::MainOs => 0x00,
            PowerOnReason::ChargeOnly => 0x0a,
            PowerOnReason::Provisioning => 0x0e,
            PowerOnReason::Recovery => 0x0c,
        }
    }

    /// Reads the reason from the control device, falling back to
    /// provisioning when it is unreadable.
    pub fn read<D: ControlDevice + ?Sized>(device: &mut D) -> Self {
        match device.read_power_on_reason() {
            Ok(code) => Self::from_code(code),
            Err(err) => {
                error!("unable to read power-on reason: {err}");
                PowerOnReason::Provisioning
            }
        }
    }
}

/// Next stage chosen at start-up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootStage {
    /// Hand over to the recovery binary.
    Recovery,
    /// Stay in charge-only mode until the user boots or unplugs.
    ChargeOnly,
    /// Charge until the battery clears the gate, then provision.
    ChargeThenProvision,
    /// Run the OTA trigger and the provisioning listener.
    Provision,
}

/// Picks the boot stage from the recorded reason and the boot admission
/// verdict.
#[must_use]
pub const fn select_stage(reason: PowerOnReason, can_boot: bool) -> BootStage {
    match reason {
        PowerOnReason::Recovery => BootStage::Recovery,
        PowerOnReason::ChargeOnly => BootStage::ChargeOnly,
        PowerOnReason::MainOs | PowerOnReason::Provisioning if !can_boot => {
            BootStage::ChargeThenProvision
        }
        PowerOnReason::MainOs | PowerOnReason::Provisioning => BootStage::Provision,
    }
}

/// Mounts the log partition and enables the log collection service.
pub fn enable_log_partition<P>(table: &PartitionTable, ports: &mut P)
where
    P: VolumePorts + PropertyStore + ?Sized,
{
    if let Err(err) = volume::mount_by_name(table, "ilog", ports) {
        warn!("unable to mount the log partition: {err}");
        return;
    }
    if let Err(err) = ports.set_property("service.apk_logfs.enable", "1") {
        warn!("unable to enable log service: {err}");
    }
}

/// Major/minor pair as stored in the revision record.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
}

impl FwVersion {
    /// Reads the pair whose major byte sits at `offset` and minor byte right
    /// before it.
    #[must_use]
    pub const fn at(record: &[u8; FW_REVISION_LEN], offset: usize) -> Self {
        Self {
            major: record[offset],
            minor: record[offset - 1],
        }
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}", self.major, self.minor)
    }
}

/// Offset of the IFWI major byte in the revision record.
pub const IFWI_OFFSET: usize = 0x0f;

/// Decoded firmware revision record.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FirmwareInfo {
    pub ia32_cpu: FwVersion,
    pub ia32_supp: FwVersion,
    pub ia32_vh: FwVersion,
    pub scu_rom: FwVersion,
    pub scu_rt: FwVersion,
    pub punit: FwVersion,
    pub ifwi: FwVersion,
}

impl FirmwareInfo {
    #[must_use]
    pub const fn from_record(record: &[u8; FW_REVISION_LEN]) -> Self {
        Self {
            ia32_cpu: FwVersion::at(record, 0x07),
            ia32_supp: FwVersion::at(record, 0x09),
            ia32_vh: FwVersion::at(record, 0x0b),
            scu_rom: FwVersion::at(record, 0x03),
            scu_rt: FwVersion::at(record, 0x01),
            punit: FwVersion::at(record, 0x05),
            ifwi: FwVersion::at(record, IFWI_OFFSET),
        }
    }

    /// Human readable summary, one component group per line.
    #[must_use]
    pub fn lines(&self) -> [String; 3] {
        [
            format!(
                "IA32 FW:    CPU-V {}     SUPP-V {}     VH-V {}",
                self.ia32_cpu, self.ia32_supp, self.ia32_vh
            ),
            format!("SCU FW:     ROM-V {}     RT-V {}", self.scu_rom, self.scu_rt),
            format!("PUNIT FW:   V {}         IFWI:   V {}", self.punit, self.ifwi),
        ]
    }
}

/// Product identification read from the property file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProductInfo {
    pub name: Option<String>,
    pub device: Option<String>,
}

impl ProductInfo {
    /// Extracts `ro.product.name` and `ro.product.device`, upper-cased.
    #[must_use]
    pub fn from_properties(text: &str) -> Self {
        Self {
            name: property(text, "ro.product.name").map(str::to_ascii_uppercase),
            device: property(text, "ro.product.device").map(str::to_ascii_uppercase),
        }
    }

    #[must_use]
    pub fn line(&self) -> String {
        format!(
            "PRODUCT_NAME:{}      PRODUCT_DEVICE:{}",
            self.name.as_deref().unwrap_or(""),
            self.device.as_deref().unwrap_or("")
        )
    }
}

fn property_line<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str), ContextError> {
    let key = take_till(1.., '=').parse_next(input)?;
    '='.parse_next(input)?;
    let value = rest.parse_next(input)?;
    Ok((key.trim(), value.trim()))
}

/// Looks up `key` in a `key=value` property file. Comment lines are skipped.
#[must_use]
pub fn property<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| property_line.parse(line).ok())
        .find_map(|(name, value)| (name == key).then_some(value))
}

/// Reads and decodes the firmware record, logging the summary.
pub fn firmware_info<D: ControlDevice + ?Sized>(device: &mut D) -> Option<FirmwareInfo> {
    match device.read_fw_revision() {
        Ok(record) => {
            let fw = FirmwareInfo::from_record(&record);
            for line in fw.lines() {
                info!("{line}");
            }
            Some(fw)
        }
        Err(err) => {
            error!("unable to read firmware revision: {err}");
            None
        }
    }
}

/// Collects every information line shown at start-up.
pub fn info_lines<D: ControlDevice + ?Sized>(device: &mut D, properties: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(fw) = firmware_info(device) {
        lines.extend(fw.lines());
    }
    let product = properties.map(ProductInfo::from_properties).unwrap_or_default();
    lines.push(product.line());
    lines
}
