//! Battery and charger status, the voltage gate and the power event stream.

pub mod charge;
pub mod governor;

use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::pubsub::{ImmediatePublisher, PubSubChannel};
use log::error;
use portable_atomic::{AtomicBool, Ordering};
use winnow::ModalResult;
use winnow::ascii::dec_int;
use winnow::combinator::opt;
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::{rest, take_till};

use crate::fastboot::AdmissionGate;
use crate::platform::{ControlDevice, PlatformError};

/// Queue depth of the power event channel.
pub const POWER_EVENT_CAPACITY: usize = 16;
/// Maximum number of power event subscribers.
pub const POWER_EVENT_SUBSCRIBERS: usize = 4;
/// Maximum number of power event publishers.
pub const POWER_EVENT_PUBLISHERS: usize = 2;

/// Channel carrying [`PowerEvent`]s from the governor to its consumers.
pub type PowerEventChannel<M> = PubSubChannel<
    M,
    PowerEvent,
    POWER_EVENT_CAPACITY,
    POWER_EVENT_SUBSCRIBERS,
    POWER_EVENT_PUBLISHERS,
>;

/// Charging state reported by the kernel power-supply class.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ChargeStatus {
    #[default]
    Unknown,
    Charging,
    Discharging,
    NotCharging,
    Full,
}

impl ChargeStatus {
    /// Parses the kernel `STATUS` text. Unrecognised text maps to `Unknown`.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        match text.trim() {
            "Charging" => ChargeStatus::Charging,
            "Discharging" => ChargeStatus::Discharging,
            "Not charging" => ChargeStatus::NotCharging,
            "Full" => ChargeStatus::Full,
            _ => ChargeStatus::Unknown,
        }
    }
}

/// Snapshot of one power supply.
///
/// `status` only carries meaning while `present` is set.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PowerSupplyStatus {
    pub present: bool,
    /// Microvolts.
    pub voltage_now: i32,
    /// Microamps.
    pub current_now: i32,
    /// Percent; may briefly exceed 100.
    pub capacity: i32,
    /// Tenths of a degree Celsius.
    pub temperature: i32,
    /// Microamp-hours.
    pub charge_now: i32,
    pub charge_full: i32,
    pub charge_full_design: i32,
    pub status: ChargeStatus,
}

impl PowerSupplyStatus {
    /// Returns `true` when the battery is not gaining charge from `charger`.
    #[must_use]
    pub fn is_draining(&self, charger: &PowerSupplyStatus) -> bool {
        !charger.present || self.status != ChargeStatus::Charging
    }
}

/// Errors raised while parsing a uevent record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UeventError {
    /// A numeric attribute did not hold a decimal integer.
    InvalidValue { line: usize },
}

impl fmt::Display for UeventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UeventError::InvalidValue { line } => {
                write!(f, "invalid numeric value on uevent line {line}")
            }
        }
    }
}

impl core::error::Error for UeventError {}

fn uevent_line<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str), ContextError> {
    let _ = opt("POWER_SUPPLY_").parse_next(input)?;
    let key = take_till(1.., '=').parse_next(input)?;
    '='.parse_next(input)?;
    let value = rest.parse_next(input)?;
    Ok((key, value))
}

fn parse_int(value: &str) -> Option<i32> {
    dec_int::<_, i32, ContextError>.parse(value.trim()).ok()
}

/// Refreshes `status` in place from a `KEY=value` uevent record.
///
/// Keys may carry the kernel `POWER_SUPPLY_` prefix. Unknown keys and lines
/// without `=` are ignored; attributes missing from the record keep their
/// previous value.
pub fn apply_uevent(status: &mut PowerSupplyStatus, text: &str) -> Result<(), UeventError> {
    for (index, line) in text.lines().enumerate() {
        let Ok((key, value)) = uevent_line.parse(line.trim_end_matches('\r')) else {
            continue;
        };
        let field = match key {
            "PRESENT" => {
                let present = parse_int(value).ok_or(UeventError::InvalidValue { line: index })?;
                status.present = present != 0;
                continue;
            }
            "STATUS" => {
                status.status = ChargeStatus::from_text(value);
                continue;
            }
            "VOLTAGE_NOW" => &mut status.voltage_now,
            "CURRENT_NOW" => &mut status.current_now,
            "CAPACITY" => &mut status.capacity,
            "TEMP" => &mut status.temperature,
            "CHARGE_NOW" => &mut status.charge_now,
            "CHARGE_FULL" => &mut status.charge_full,
            "CHARGE_FULL_DESIGN" => &mut status.charge_full_design,
            _ => continue,
        };
        *field = parse_int(value).ok_or(UeventError::InvalidValue { line: index })?;
    }
    Ok(())
}

/// Parses a complete uevent record into a fresh snapshot.
pub fn parse_uevent(text: &str) -> Result<PowerSupplyStatus, UeventError> {
    let mut status = PowerSupplyStatus::default();
    apply_uevent(&mut status, text)?;
    Ok(status)
}

/// Synchronous source of battery and charger snapshots.
pub trait PowerStatusReader {
    fn battery(&mut self) -> Result<PowerSupplyStatus, PlatformError>;

    fn charger(&mut self) -> Result<PowerSupplyStatus, PlatformError>;
}

/// Minimum battery voltage (µV) required to boot the main OS or accept
/// commands.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct VoltageGate(u32);

impl VoltageGate {
    /// Wraps a threshold in microvolts.
    #[must_use]
    pub const fn from_microvolts(microvolts: u32) -> Self {
        Self(microvolts)
    }

    /// Derives the gate from the VBATTCRIT calibration word, whose upper half
    /// holds the threshold in millivolts.
    #[must_use]
    pub const fn from_vbattcrit(raw: u32) -> Self {
        Self((raw >> 16) * 1000)
    }

    /// Reads the calibration word; an unreadable device yields a zero gate.
    pub fn read<D: ControlDevice + ?Sized>(device: &mut D) -> Self {
        match device.read_vbattcrit() {
            Ok(raw) => Self::from_vbattcrit(raw),
            Err(err) => {
                error!("unable to read VBATTCRIT: {err}");
                Self(0)
            }
        }
    }

    /// Threshold in microvolts.
    #[must_use]
    pub const fn microvolts(self) -> u32 {
        self.0
    }

    /// Returns `true` when `voltage_now` (µV) meets the gate.
    #[must_use]
    pub fn permits(self, voltage_now: i32) -> bool {
        i64::from(voltage_now) >= i64::from(self.0)
    }

    /// Returns `true` when `voltage_now` (µV) is strictly above the gate.
    #[must_use]
    pub fn exceeded_by(self, voltage_now: i32) -> bool {
        i64::from(voltage_now) > i64::from(self.0)
    }
}

/// Boot admission: re-reads the battery and compares it against `gate`.
///
/// An unreadable battery never admits a boot.
pub fn can_boot<R: PowerStatusReader + ?Sized>(reader: &mut R, gate: VoltageGate) -> bool {
    match reader.battery() {
        Ok(battery) => gate.permits(battery.voltage_now),
        Err(err) => {
            error!("battery status unavailable: {err}");
            false
        }
    }
}

/// Side of the voltage gate the battery currently sits on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GateLevel {
    Low,
    High,
}

/// Why a deferred power-off was scheduled, ordered by urgency.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ShutdownReason {
    BatteryEmpty,
    ChargerLost,
    OverTemperature,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::BatteryEmpty => f.write_str("battery empty"),
            ShutdownReason::ChargerLost => f.write_str("charger lost"),
            ShutdownReason::OverTemperature => f.write_str("over temperature"),
        }
    }
}

/// Edge-triggered notifications produced by the governor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerEvent {
    ChargerInserted,
    ChargerRemoved,
    CapacityUpdate(i32),
    VoltageGateCrossed(GateLevel),
    BatteryFull,
    OverTemperature,
    ShutdownScheduled(ShutdownReason),
}

impl fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerEvent::ChargerInserted => f.write_str("charger-inserted"),
            PowerEvent::ChargerRemoved => f.write_str("charger-removed"),
            PowerEvent::CapacityUpdate(pct) => write!(f, "capacity {pct}%"),
            PowerEvent::VoltageGateCrossed(GateLevel::Low) => f.write_str("voltage-low"),
            PowerEvent::VoltageGateCrossed(GateLevel::High) => f.write_str("voltage-high"),
            PowerEvent::BatteryFull => f.write_str("battery-full"),
            PowerEvent::OverTemperature => f.write_str("over-temperature"),
            PowerEvent::ShutdownScheduled(reason) => write!(f, "shutdown-scheduled ({reason})"),
        }
    }
}

/// Destination for governor events.
pub trait PowerEventSink {
    fn publish(&mut self, event: PowerEvent);
}

impl PowerEventSink for alloc::vec::Vec<PowerEvent> {
    fn publish(&mut self, event: PowerEvent) {
        self.push(event);
    }
}

impl<M: RawMutex, const CAP: usize, const SUBS: usize, const PUBS: usize> PowerEventSink
    for ImmediatePublisher<'_, M, PowerEvent, CAP, SUBS, PUBS>
{
    fn publish(&mut self, event: PowerEvent) {
        self.publish_immediate(event);
    }
}

/// Shared low-power admission flag written by the governor.
///
/// Readers may observe a value up to one poll interval old.
#[derive(Debug, Default)]
pub struct LowPowerFlag(AtomicBool);

impl LowPowerFlag {
    /// Creates a flag in the "power ok" state.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Records whether the battery sits below the gate.
    pub fn set(&self, low: bool) {
        self.0.store(low, Ordering::Release);
    }

    /// Returns the last recorded value.
    #[must_use]
    pub fn is_low(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl AdmissionGate for LowPowerFlag {
    fn is_power_low(&self) -> bool {
        self.is_low()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATTERY_UEVENT: &str = "POWER_SUPPLY_NAME=max17042_battery\n\
        POWER_SUPPLY_PRESENT=1\n\
        POWER_SUPPLY_STATUS=Not charging\n\
        POWER_SUPPLY_VOLTAGE_NOW=3712000\n\
        POWER_SUPPLY_CURRENT_NOW=-215000\n\
        POWER_SUPPLY_CAPACITY=42\n\
        POWER_SUPPLY_TEMP=281\n\
        POWER_SUPPLY_CHARGE_NOW=610000\n\
        POWER_SUPPLY_CHARGE_FULL=1400000\n\
        POWER_SUPPLY_CHARGE_FULL_DESIGN=1500000\n";

    #[test]
    fn parses_prefixed_uevent_record() {
        let status = parse_uevent(BATTERY_UEVENT).expect("record should parse");

        assert!(status.present);
        assert_eq!(status.status, ChargeStatus::NotCharging);
        assert_eq!(status.voltage_now, 3_712_000);
        assert_eq!(status.current_now, -215_000);
        assert_eq!(status.capacity, 42);
        assert_eq!(status.temperature, 281);
        assert_eq!(status.charge_now, 610_000);
        assert_eq!(status.charge_full, 1_400_000);
        assert_eq!(status.charge_full_design, 1_500_000);
    }

    #[test]
    fn keys_match_exactly() {
        let status = parse_uevent("CHARGE_FULL_DESIGN=9\nCHARGE_FULL=7\nONLINE=1\n")
            .expect("record should parse");
        assert_eq!(status.charge_full, 7);
        assert_eq!(status.charge_full_design, 9);
        assert!(!status.present);
    }

    #[test]
    fn apply_keeps_missing_attributes() {
        let mut status = parse_uevent(BATTERY_UEVENT).expect("record should parse");
        apply_uevent(&mut status, "CAPACITY=41\nSTATUS=Charging\n").expect("update");

        assert_eq!(status.capacity, 41);
        assert_eq!(status.status, ChargeStatus::Charging);
        assert_eq!(status.voltage_now, 3_712_000);
    }

    #[test]
    fn rejects_non_numeric_values() {
        assert_eq!(
            parse_uevent("PRESENT=1\nVOLTAGE_NOW=lots\n"),
            Err(UeventError::InvalidValue { line: 1 })
        );
    }

    #[test]
    fn unknown_status_text_maps_to_unknown() {
        assert_eq!(ChargeStatus::from_text("Exploding"), ChargeStatus::Unknown);
        assert_eq!(ChargeStatus::from_text("Full\r"), ChargeStatus::Full);
    }

    #[test]
    fn gate_comes_from_upper_half_of_vbattcrit() {
        let gate = VoltageGate::from_vbattcrit(0x0E10_0000 | 0x1234);
        assert_eq!(gate.microvolts(), 3_600_000);
    }

    #[test]
    fn gate_is_monotonic() {
        let gate = VoltageGate::from_microvolts(3_600_000);
        for voltage in [0, 3_000_000, 3_599_999] {
            assert!(!gate.permits(voltage));
        }
        for voltage in [3_600_000, 3_600_001, 4_200_000] {
            assert!(gate.permits(voltage));
        }
        assert!(!gate.exceeded_by(3_600_000));
        assert!(gate.exceeded_by(3_600_001));
    }

    #[test]
    fn low_power_flag_acts_as_admission_gate() {
        let flag = LowPowerFlag::new();
        assert!(!flag.is_power_low());
        flag.set(true);
        assert!(flag.is_power_low());
    }
}
