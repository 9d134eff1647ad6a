use std::thread;
use std::time::{Duration, Instant};

use droidboot_core::power::charge::{CosAction, CosConfig, CosSupervisor, charged_past_gate};
use droidboot_core::power::{PowerStatusReader, VoltageGate};
use log::{info, warn};

use super::KEY_EVENTS;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::hw::LinuxPlatform;
use crate::hw::input;
use crate::hw::power::SysfsBacklight;
use crate::status;

/// Poll period of the charge-only loop; bounds key latency.
const COS_TICK: Duration = Duration::from_millis(50);

/// Charge-only mode: returns once a boot into the main OS was requested.
pub fn run_cos<R: PowerStatusReader>(
    config: &DaemonConfig,
    cos: CosConfig,
    gate: VoltageGate,
    reader: &mut R,
    platform: &mut LinuxPlatform,
) {
    let mut supervisor = CosSupervisor::new(cos, gate);
    let mut backlight = SysfsBacklight::find(&config.paths.backlight_root);
    let readers = input::spawn_readers(&config.paths.input_dir, &KEY_EVENTS);
    info!("charge-only mode, {readers} input devices");

    supervisor.start(Instant::now(), &mut backlight);
    loop {
        while let Ok(key) = KEY_EVENTS.try_receive() {
            supervisor.on_key(Instant::now(), key, &mut backlight);
        }
        match supervisor.poll(Instant::now(), reader, platform, &mut backlight) {
            CosAction::Booting => return,
            CosAction::BootRefused => {
                let status = status::snapshot();
                warn!(
                    "LOW POWER, CHARGING... capacity {:?}, charger {}, below gate {}",
                    status.capacity, status.charger_online, status.below_gate
                );
            }
            CosAction::Idle => {}
        }
        thread::sleep(COS_TICK);
    }
}

/// Provisioning charge wait: returns once the battery is strictly above the
/// gate, or fails when the governor has announced a shutdown.
pub fn run_pos<R: PowerStatusReader>(
    gate: VoltageGate,
    reader: &mut R,
    interval: Duration,
) -> Result<(), DaemonError> {
    info!("LOW POWER, CHARGING...");
    loop {
        match charged_past_gate(reader, gate) {
            Ok(true) => {
                info!("battery above {} µV, continuing", gate.microvolts());
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => warn!("battery status unavailable: {err}"),
        }
        if status::snapshot().shutdown_pending {
            return Err(DaemonError::ChargeAborted);
        }
        thread::sleep(interval);
    }
}
