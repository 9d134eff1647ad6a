//! Charge-only supervision.
//!
//! Provisioning boots (POS) simply wait until the battery climbs above the
//! voltage gate. Charge-only boots (COS) additionally watch the power key: a
//! long press boots the main OS when the battery allows it, and any key
//! activity lights the backlight for a while. Every timer is a deadline
//! checked from [`CosSupervisor::poll`], which the caller drives from the same
//! loop that ticks the power governor.

use core::ops::Add;
use core::time::Duration;

use log::{error, info, warn};

use super::{PowerStatusReader, VoltageGate, can_boot};
use crate::boot::PowerOnReason;
use crate::platform::{ControlDevice, PlatformError, PowerControl, RestartMode};

/// How long the power key must stay down before the main OS is booted.
pub const DEFAULT_BOOT_HOLD: Duration = Duration::from_secs(3);
/// How long the backlight stays on after the last key activity.
pub const DEFAULT_BACKLIGHT_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns `true` once the battery voltage is strictly above `gate`.
pub fn charged_past_gate<R: PowerStatusReader + ?Sized>(
    reader: &mut R,
    gate: VoltageGate,
) -> Result<bool, PlatformError> {
    let battery = reader.battery()?;
    Ok(gate.exceeded_by(battery.voltage_now))
}

/// Power key transitions delivered by the input reader.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeyEvent {
    PowerPressed,
    PowerReleased,
}

/// Display backlight switch.
pub trait Backlight {
    fn set_backlight(&mut self, on: bool);
}

/// Backlight that ignores every request.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopBacklight;

impl Backlight for NoopBacklight {
    fn set_backlight(&mut self, _on: bool) {}
}

/// COS timing knobs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CosConfig {
    pub boot_hold: Duration,
    pub backlight_timeout: Duration,
}

impl Default for CosConfig {
    fn default() -> Self {
        Self {
            boot_hold: DEFAULT_BOOT_HOLD,
            backlight_timeout: DEFAULT_BACKLIGHT_TIMEOUT,
        }
    }
}

/// What a [`CosSupervisor::poll`] call did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CosAction {
    /// Nothing due.
    Idle,
    /// The hold deadline passed but the battery is below the gate.
    BootRefused,
    /// The main OS reason was recorded and a restart requested.
    Booting,
}

/// Deadline-driven power key and backlight handling for charge-only mode.
pub struct CosSupervisor<I> {
    config: CosConfig,
    gate: VoltageGate,
    backlight_on: bool,
    backlight_deadline: Option<I>,
    hold_deadline: Option<I>,
    booting: bool,
}

impl<I> CosSupervisor<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    #[must_use]
    pub const fn new(config: CosConfig, gate: VoltageGate) -> Self {
        Self {
            config,
            gate,
            backlight_on: false,
            backlight_deadline: None,
            hold_deadline: None,
            booting: false,
        }
    }

    /// Lights the backlight for the initial timeout.
    pub fn start<B: Backlight + ?Sized>(&mut self, now: I, backlight: &mut B) {
        self.switch_backlight(true, backlight);
        self.backlight_deadline = Some(now + self.config.backlight_timeout);
    }

    #[must_use]
    pub const fn backlight_on(&self) -> bool {
        self.backlight_on
    }

    /// Returns `true` while a press is waiting for its hold deadline.
    #[must_use]
    pub const fn hold_pending(&self) -> bool {
        self.hold_deadline.is_some()
    }

    /// Returns `true` once a boot into the main OS has been requested.
    #[must_use]
    pub const fn booting(&self) -> bool {
        self.booting
    }

    /// Applies a key transition.
    pub fn on_key<B: Backlight + ?Sized>(&mut self, now: I, event: KeyEvent, backlight: &mut B) {
        if self.booting {
            return;
        }
        match event {
            KeyEvent::PowerPressed => {
                self.switch_backlight(true, backlight);
                self.backlight_deadline = None;
                self.hold_deadline = Some(now + self.config.boot_hold);
            }
            KeyEvent::PowerReleased => {
                if self.hold_deadline.take().is_some() {
                    info!("power key released before boot hold");
                }
                self.backlight_deadline = Some(now + self.config.backlight_timeout);
            }
        }
    }

    /// Fires whichever deadlines have passed.
    pub fn poll<R, P, B>(
        &mut self,
        now: I,
        reader: &mut R,
        ports: &mut P,
        backlight: &mut B,
    ) -> CosAction
    where
        R: PowerStatusReader + ?Sized,
        P: ControlDevice + PowerControl + ?Sized,
        B: Backlight + ?Sized,
    {
        let mut action = CosAction::Idle;

        if self.hold_deadline.is_some_and(|deadline| now >= deadline) {
            self.hold_deadline = None;
            if can_boot(reader, self.gate) {
                info!("power key held, booting main OS");
                if let Err(err) = ports.write_power_on_reason(PowerOnReason::MainOs.code()) {
                    error!("unable to record power-on reason: {err}");
                }
                ports.restart(RestartMode::Android);
                self.booting = true;
                return CosAction::Booting;
            }
            warn!("battery below gate, staying in charge mode");
            self.backlight_deadline = Some(now + self.config.backlight_timeout);
            action = CosAction::BootRefused;
        }

        if self.backlight_deadline.is_some_and(|deadline| now >= deadline) {
            self.backlight_deadline = None;
            self.switch_backlight(false, backlight);
        }

        action
    }

    fn switch_backlight<B: Backlight + ?Sized>(&mut self, on: bool, backlight: &mut B) {
        if self.backlight_on != on {
            self.backlight_on = on;
            backlight.set_backlight(on);
        }
    }
}
