//! Shared status storage for the daemon.
//!
//! The power event consumer records the latest battery picture in atomics so
//! other threads (the charge loop, `info`) can read a consistent-enough
//! snapshot without locking.

use droidboot_core::power::{GateLevel, PowerEvent};
use portable_atomic::{AtomicBool, AtomicI32, Ordering};

const UNKNOWN_CAPACITY: i32 = -1;

/// Last reported capacity in percent (-1 == unknown).
static CAPACITY: AtomicI32 = AtomicI32::new(UNKNOWN_CAPACITY);
/// Whether the charger was present at the last edge.
static CHARGER_ONLINE: AtomicBool = AtomicBool::new(false);
/// Whether the battery sat below the voltage gate at the last edge.
static BELOW_GATE: AtomicBool = AtomicBool::new(false);
/// Whether a deferred shutdown has been announced.
static SHUTDOWN_PENDING: AtomicBool = AtomicBool::new(false);

/// Copy of the shared status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusSnapshot {
    pub capacity: Option<i32>,
    pub charger_online: bool,
    pub below_gate: bool,
    pub shutdown_pending: bool,
}

/// Folds one governor event into the shared status.
pub fn record(event: PowerEvent) {
    match event {
        PowerEvent::ChargerInserted => CHARGER_ONLINE.store(true, Ordering::Relaxed),
        PowerEvent::ChargerRemoved => CHARGER_ONLINE.store(false, Ordering::Relaxed),
        PowerEvent::CapacityUpdate(pct) => CAPACITY.store(pct, Ordering::Relaxed),
        PowerEvent::VoltageGateCrossed(level) => {
            BELOW_GATE.store(level == GateLevel::Low, Ordering::Relaxed);
        }
        PowerEvent::ShutdownScheduled(_) => SHUTDOWN_PENDING.store(true, Ordering::Relaxed),
        PowerEvent::BatteryFull | PowerEvent::OverTemperature => {}
    }
}

/// Seeds the charger state from the first direct reading.
pub fn set_charger_online(online: bool) {
    CHARGER_ONLINE.store(online, Ordering::Relaxed);
}

pub fn snapshot() -> StatusSnapshot {
    let capacity = CAPACITY.load(Ordering::Relaxed);
    StatusSnapshot {
        capacity: (capacity != UNKNOWN_CAPACITY).then_some(capacity),
        charger_online: CHARGER_ONLINE.load(Ordering::Relaxed),
        below_gate: BELOW_GATE.load(Ordering::Relaxed),
        shutdown_pending: SHUTDOWN_PENDING.load(Ordering::Relaxed),
    }
}
