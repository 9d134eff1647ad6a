use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use droidboot_core::power::governor::{GovernorConfig, PowerGovernor};
use droidboot_core::power::{LowPowerFlag, PowerStatusReader, VoltageGate};
use log::{debug, info, warn};

use super::POWER_EVENTS;
use crate::error::DaemonError;
use crate::hw::Reboot;
use crate::hw::power::SysfsPowerReader;
use crate::status;

/// Starts the governor thread and the event consumer thread, returning the
/// admission flag the fastboot engine consults.
pub fn spawn(
    config: GovernorConfig,
    gate: VoltageGate,
    mut reader: SysfsPowerReader,
    mut power: Reboot,
    interval: Duration,
) -> Result<Arc<LowPowerFlag>, DaemonError> {
    let low_power = Arc::new(LowPowerFlag::new());
    let mut governor = PowerGovernor::new(config, gate, Arc::clone(&low_power));

    if let Ok(charger) = reader.charger() {
        status::set_charger_online(charger.present);
    }

    let mut subscriber = POWER_EVENTS
        .subscriber()
        .map_err(|_| DaemonError::EventChannel)?;
    thread::Builder::new()
        .name("power-events".into())
        .spawn(move || {
            loop {
                while let Some(event) = subscriber.try_next_message_pure() {
                    info!("power event: {event}");
                    status::record(event);
                }
                thread::sleep(interval / 4);
            }
        })?;

    thread::Builder::new()
        .name("governor".into())
        .spawn(move || {
            let mut publisher = POWER_EVENTS.immediate_publisher();
            loop {
                match governor.tick(Instant::now(), &mut reader, &mut publisher, &mut power) {
                    Ok(outcome) => {
                        if let Some(reason) = outcome.powered_off {
                            warn!("powered off: {reason}");
                        }
                    }
                    Err(err) => debug!("governor tick without a sample: {err}"),
                }
                thread::sleep(interval);
            }
        })?;

    Ok(low_power)
}
