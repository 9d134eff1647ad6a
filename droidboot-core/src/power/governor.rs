//! Poll-driven power governor.
//!
//! Each [`PowerGovernor::tick`] samples the battery and charger, publishes the
//! edges it observes and manages at most one pending shutdown. Shutdowns are
//! deferred: the governor announces them, keeps ticking so consumers can drain
//! the event queue, and only calls [`PowerControl::power_off`] once the grace
//! deadline passes.

use alloc::sync::Arc;
use core::ops::Add;
use core::time::Duration;

use log::{info, warn};

use super::{
    ChargeStatus, GateLevel, LowPowerFlag, PowerEvent, PowerEventSink, PowerStatusReader,
    PowerSupplyStatus, ShutdownReason, VoltageGate,
};
use crate::platform::{PlatformError, PowerControl};

/// Consecutive charger-absent ticks tolerated before shutting down.
pub const DEFAULT_CHARGER_LOSS_BUDGET: u8 = 5;
/// Delay between announcing and executing a shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Battery temperature (tenths of °C) above which the device powers off.
pub const DEFAULT_OVER_TEMPERATURE: i32 = 730;
/// Capacity (%) at or below which a warning is logged while draining.
pub const DEFAULT_LOW_CAPACITY_WARNING: i32 = 10;

/// Tunables for [`PowerGovernor`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GovernorConfig {
    pub charger_loss_budget: u8,
    pub shutdown_grace: Duration,
    pub over_temperature: i32,
    pub low_capacity_warning: i32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            charger_loss_budget: DEFAULT_CHARGER_LOSS_BUDGET,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            over_temperature: DEFAULT_OVER_TEMPERATURE,
            low_capacity_warning: DEFAULT_LOW_CAPACITY_WARNING,
        }
    }
}

/// Shutdown waiting for its grace deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PendingShutdown<I> {
    pub reason: ShutdownReason,
    pub deadline: I,
}

/// Result of a single governor tick.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TickOutcome {
    /// Battery voltage sits below the gate.
    pub low_power: bool,
    /// Shutdown executed during this tick.
    pub powered_off: Option<ShutdownReason>,
}

#[derive(Copy, Clone, Debug, Default)]
struct Edges {
    charger_present: Option<bool>,
    full: bool,
    level: Option<GateLevel>,
    capacity: Option<i32>,
    capacity_warned: bool,
}

/// Battery/charger supervisor generic over the caller's monotonic instant.
pub struct PowerGovernor<I> {
    config: GovernorConfig,
    gate: VoltageGate,
    low_power: Arc<LowPowerFlag>,
    loss_ticks: u8,
    edges: Edges,
    pending: Option<PendingShutdown<I>>,
    shutdown_issued: bool,
}

impl<I> PowerGovernor<I>
where
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Creates a governor enforcing `gate` and publishing its verdict on
    /// `low_power`.
    #[must_use]
    pub fn new(config: GovernorConfig, gate: VoltageGate, low_power: Arc<LowPowerFlag>) -> Self {
        Self {
            config,
            gate,
            low_power,
            loss_ticks: 0,
            edges: Edges::default(),
            pending: None,
            shutdown_issued: false,
        }
    }

    /// Voltage gate in force.
    #[must_use]
    pub const fn gate(&self) -> VoltageGate {
        self.gate
    }

    /// Shared admission flag.
    #[must_use]
    pub fn low_power_flag(&self) -> Arc<LowPowerFlag> {
        Arc::clone(&self.low_power)
    }

    /// Shutdown waiting for its deadline, if any.
    #[must_use]
    pub const fn pending_shutdown(&self) -> Option<&PendingShutdown<I>> {
        self.pending.as_ref()
    }

    /// Consecutive ticks the charger has been absent.
    #[must_use]
    pub const fn charger_loss_ticks(&self) -> u8 {
        self.loss_ticks
    }

    /// Returns `true` once a power-off request has been issued.
    #[must_use]
    pub const fn shutdown_issued(&self) -> bool {
        self.shutdown_issued
    }

    /// Samples both supplies and applies the decision rules.
    ///
    /// A failed read is treated as a low battery with no charger: it counts
    /// against the charger-loss budget and a shutdown whose deadline has
    /// passed still fires. The read error is returned unless that happens.
    pub fn tick<R, S, P>(
        &mut self,
        now: I,
        reader: &mut R,
        sink: &mut S,
        power: &mut P,
    ) -> Result<TickOutcome, PlatformError>
    where
        R: PowerStatusReader + ?Sized,
        S: PowerEventSink + ?Sized,
        P: PowerControl + ?Sized,
    {
        let sample = match reader.battery() {
            Ok(battery) => reader.charger().map(|charger| (battery, charger)),
            Err(err) => Err(err),
        };
        match sample {
            Ok((battery, charger)) => Ok(self.evaluate(now, &battery, &charger, sink, power)),
            Err(err) => {
                self.read_failed(now, err, sink);
                match self.fire_due(now, power) {
                    Some(reason) => Ok(TickOutcome {
                        low_power: true,
                        powered_off: Some(reason),
                    }),
                    None => Err(err),
                }
            }
        }
    }

    fn read_failed<S: PowerEventSink + ?Sized>(
        &mut self,
        now: I,
        err: PlatformError,
        sink: &mut S,
    ) {
        warn!("power supply read failed: {err}");
        self.low_power.set(true);
        if self.edges.level != Some(GateLevel::Low) {
            self.edges.level = Some(GateLevel::Low);
            sink.publish(PowerEvent::VoltageGateCrossed(GateLevel::Low));
        }
        self.loss_ticks = self.loss_ticks.saturating_add(1);
        if self.loss_ticks > self.config.charger_loss_budget {
            self.schedule(now, ShutdownReason::ChargerLost, sink);
        }
    }

    /// Applies the decision rules to already sampled supplies.
    pub fn evaluate<S, P>(
        &mut self,
        now: I,
        battery: &PowerSupplyStatus,
        charger: &PowerSupplyStatus,
        sink: &mut S,
        power: &mut P,
    ) -> TickOutcome
    where
        S: PowerEventSink + ?Sized,
        P: PowerControl + ?Sized,
    {
        self.track_charger(now, charger, sink);

        let full = battery.status == ChargeStatus::Full && self.loss_ticks == 0;
        if full && !self.edges.full {
            info!("battery full");
            sink.publish(PowerEvent::BatteryFull);
        }
        self.edges.full = full;

        if self.edges.capacity != Some(battery.capacity) {
            self.edges.capacity = Some(battery.capacity);
            sink.publish(PowerEvent::CapacityUpdate(battery.capacity));
        }

        let low = !self.gate.permits(battery.voltage_now);
        self.low_power.set(low);
        let level = if low { GateLevel::Low } else { GateLevel::High };
        if self.edges.level != Some(level) {
            self.edges.level = Some(level);
            info!(
                "battery {} µV against gate {} µV: {level:?}",
                battery.voltage_now,
                self.gate.microvolts()
            );
            sink.publish(PowerEvent::VoltageGateCrossed(level));
        }

        let draining = battery.is_draining(charger);
        self.track_capacity(now, battery, draining, sink);

        if battery.temperature > self.config.over_temperature
            && self.schedule(now, ShutdownReason::OverTemperature, sink)
        {
            warn!("battery temperature {} over limit", battery.temperature);
            sink.publish(PowerEvent::OverTemperature);
        }

        TickOutcome {
            low_power: low,
            powered_off: self.fire_due(now, power),
        }
    }

    fn track_charger<S: PowerEventSink + ?Sized>(
        &mut self,
        now: I,
        charger: &PowerSupplyStatus,
        sink: &mut S,
    ) {
        if charger.present {
            if self.edges.charger_present == Some(false) {
                info!("charger back after {} ticks", self.loss_ticks);
                sink.publish(PowerEvent::ChargerInserted);
            }
            if self.loss_ticks > 0 {
                self.cancel(ShutdownReason::ChargerLost);
            }
            self.loss_ticks = 0;
        } else {
            self.loss_ticks = self.loss_ticks.saturating_add(1);
            if self.edges.charger_present != Some(false) {
                warn!("charger removed");
                sink.publish(PowerEvent::ChargerRemoved);
            }
            if self.loss_ticks > self.config.charger_loss_budget {
                self.schedule(now, ShutdownReason::ChargerLost, sink);
            }
        }
        self.edges.charger_present = Some(charger.present);
    }

    fn track_capacity<S: PowerEventSink + ?Sized>(
        &mut self,
        now: I,
        battery: &PowerSupplyStatus,
        draining: bool,
        sink: &mut S,
    ) {
        let empty = battery.capacity == 0 && draining;
        if empty {
            if self.schedule(now, ShutdownReason::BatteryEmpty, sink) {
                warn!("battery empty, confirming before power off");
            }
        } else {
            self.cancel(ShutdownReason::BatteryEmpty);
        }

        let warn_level = draining && battery.capacity <= self.config.low_capacity_warning;
        if warn_level && !self.edges.capacity_warned {
            warn!("low battery ({}%), plug in the charger", battery.capacity);
        }
        self.edges.capacity_warned = warn_level;
    }

    /// Schedules `reason` unless an equally or more urgent shutdown is
    /// already pending. Returns `true` when a new deadline was set.
    fn schedule<S: PowerEventSink + ?Sized>(
        &mut self,
        now: I,
        reason: ShutdownReason,
        sink: &mut S,
    ) -> bool {
        if self.shutdown_issued {
            return false;
        }
        if self.pending.is_some_and(|pending| pending.reason >= reason) {
            return false;
        }
        let deadline = now + self.config.shutdown_grace;
        self.pending = Some(PendingShutdown { reason, deadline });
        warn!("shutdown scheduled: {reason}");
        sink.publish(PowerEvent::ShutdownScheduled(reason));
        true
    }

    fn cancel(&mut self, reason: ShutdownReason) {
        if self.pending.is_some_and(|pending| pending.reason == reason) {
            info!("pending shutdown cancelled: {reason}");
            self.pending = None;
        }
    }

    fn fire_due<P: PowerControl + ?Sized>(&mut self, now: I, power: &mut P) -> Option<ShutdownReason> {
        let pending = self.pending?;
        if now < pending.deadline {
            return None;
        }
        self.pending = None;
        self.shutdown_issued = true;
        warn!("powering off: {}", pending.reason);
        power.power_off();
        Some(pending.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingPowerControl;
    use alloc::vec::Vec;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct MockInstant(u64);

    impl MockInstant {
        fn secs(value: u64) -> Self {
            Self(value * 1_000_000)
        }
    }

    impl Add<Duration> for MockInstant {
        type Output = Self;

        fn add(self, rhs: Duration) -> Self::Output {
            Self(self.0 + rhs.as_micros() as u64)
        }
    }

    struct Supplies {
        battery: PowerSupplyStatus,
        charger: PowerSupplyStatus,
        unreadable: bool,
    }

    impl Supplies {
        fn healthy() -> Self {
            Self {
                battery: PowerSupplyStatus {
                    present: true,
                    voltage_now: 3_900_000,
                    capacity: 60,
                    temperature: 300,
                    status: ChargeStatus::Charging,
                    ..PowerSupplyStatus::default()
                },
                charger: PowerSupplyStatus {
                    present: true,
                    ..PowerSupplyStatus::default()
                },
                unreadable: false,
            }
        }
    }

    impl PowerStatusReader for Supplies {
        fn battery(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
            if self.unreadable {
                return Err(PlatformError::Os(5));
            }
            Ok(self.battery)
        }

        fn charger(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
            Ok(self.charger)
        }
    }

    struct Harness {
        governor: PowerGovernor<MockInstant>,
        supplies: Supplies,
        events: Vec<PowerEvent>,
        power: RecordingPowerControl,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                governor: PowerGovernor::new(
                    GovernorConfig::default(),
                    VoltageGate::from_microvolts(3_600_000),
                    Arc::new(LowPowerFlag::new()),
                ),
                supplies: Supplies::healthy(),
                events: Vec::new(),
                power: RecordingPowerControl::new(),
            }
        }

        fn try_tick(&mut self, secs: u64) -> Result<TickOutcome, PlatformError> {
            self.governor.tick(
                MockInstant::secs(secs),
                &mut self.supplies,
                &mut self.events,
                &mut self.power,
            )
        }

        fn tick(&mut self, secs: u64) -> TickOutcome {
            self.try_tick(secs).expect("supplies are readable")
        }

        fn drain(&mut self) -> Vec<PowerEvent> {
            core::mem::take(&mut self.events)
        }
    }

    #[test]
    fn first_tick_publishes_initial_state() {
        let mut harness = Harness::new();
        let outcome = harness.tick(0);

        assert!(!outcome.low_power);
        assert_eq!(
            harness.drain(),
            [
                PowerEvent::CapacityUpdate(60),
                PowerEvent::VoltageGateCrossed(GateLevel::High)
            ]
        );
    }

    #[test]
    fn events_are_edge_triggered() {
        let mut harness = Harness::new();
        harness.tick(0);
        harness.drain();

        harness.tick(1);
        harness.tick(2);
        assert!(harness.drain().is_empty());

        harness.supplies.battery.capacity = 61;
        harness.tick(3);
        assert_eq!(harness.drain(), [PowerEvent::CapacityUpdate(61)]);
    }

    #[test]
    fn voltage_gate_drives_low_power_flag() {
        let mut harness = Harness::new();
        let flag = harness.governor.low_power_flag();
        harness.tick(0);
        harness.drain();

        harness.supplies.battery.voltage_now = 3_599_999;
        assert!(harness.tick(1).low_power);
        assert!(flag.is_low());
        assert_eq!(
            harness.drain(),
            [PowerEvent::VoltageGateCrossed(GateLevel::Low)]
        );

        harness.supplies.battery.voltage_now = 3_600_000;
        assert!(!harness.tick(2).low_power);
        assert!(!flag.is_low());
    }

    #[test]
    fn charger_loss_one_tick_short_of_budget_keeps_running() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.status = ChargeStatus::Discharging;

        for tick in 0..u64::from(DEFAULT_CHARGER_LOSS_BUDGET - 1) {
            harness.tick(tick);
        }

        assert_eq!(
            harness.governor.charger_loss_ticks(),
            DEFAULT_CHARGER_LOSS_BUDGET - 1
        );
        assert!(harness.governor.pending_shutdown().is_none());
    }

    #[test]
    fn charger_loss_for_exactly_budget_ticks_does_not_shut_down() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.status = ChargeStatus::Discharging;

        for tick in 0..u64::from(DEFAULT_CHARGER_LOSS_BUDGET) {
            harness.tick(tick);
        }

        assert_eq!(
            harness.governor.charger_loss_ticks(),
            DEFAULT_CHARGER_LOSS_BUDGET
        );
        assert!(harness.governor.pending_shutdown().is_none());
        let removed = harness
            .drain()
            .into_iter()
            .filter(|event| *event == PowerEvent::ChargerRemoved)
            .count();
        assert_eq!(removed, 1);
    }

    #[test]
    fn charger_loss_exceeding_budget_powers_off_exactly_once() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.status = ChargeStatus::Discharging;

        for tick in 0..=u64::from(DEFAULT_CHARGER_LOSS_BUDGET) {
            harness.tick(tick);
        }
        assert!(
            harness
                .drain()
                .contains(&PowerEvent::ShutdownScheduled(ShutdownReason::ChargerLost))
        );
        assert_eq!(harness.power.power_offs(), 0);

        let outcome = harness.tick(5 + 5);
        assert_eq!(outcome.powered_off, Some(ShutdownReason::ChargerLost));
        for tick in 11..20 {
            harness.tick(tick);
        }
        assert_eq!(harness.power.power_offs(), 1);
    }

    #[test]
    fn unreadable_supplies_still_fire_pending_shutdown() {
        let mut harness = Harness::new();
        harness.supplies.battery.temperature = 800;
        harness.tick(0);
        assert_eq!(
            harness.governor.pending_shutdown().map(|p| p.reason),
            Some(ShutdownReason::OverTemperature)
        );

        harness.supplies.unreadable = true;
        for tick in 1..5 {
            assert!(harness.try_tick(tick).is_err());
        }
        assert_eq!(harness.power.power_offs(), 0);

        let outcome = harness.try_tick(5).expect("shutdown outcome");
        assert_eq!(outcome.powered_off, Some(ShutdownReason::OverTemperature));
        for tick in 6..10 {
            let _ = harness.try_tick(tick);
        }
        assert_eq!(harness.power.power_offs(), 1);
    }

    #[test]
    fn unreadable_supplies_exhaust_charger_loss_budget() {
        let mut harness = Harness::new();
        let flag = harness.governor.low_power_flag();
        harness.tick(0);
        harness.drain();

        harness.supplies.unreadable = true;
        for tick in 1..=u64::from(DEFAULT_CHARGER_LOSS_BUDGET) {
            assert!(harness.try_tick(tick).is_err());
        }
        assert!(flag.is_low());
        assert!(harness.governor.pending_shutdown().is_none());

        let budget = u64::from(DEFAULT_CHARGER_LOSS_BUDGET);
        assert!(harness.try_tick(budget + 1).is_err());
        assert_eq!(
            harness.drain(),
            [
                PowerEvent::VoltageGateCrossed(GateLevel::Low),
                PowerEvent::ShutdownScheduled(ShutdownReason::ChargerLost)
            ]
        );

        let outcome = harness.try_tick(budget + 6).expect("shutdown outcome");
        assert_eq!(outcome.powered_off, Some(ShutdownReason::ChargerLost));
        assert_eq!(harness.power.power_offs(), 1);
    }

    #[test]
    fn readable_charger_after_failed_reads_cancels_loss_silently() {
        let mut harness = Harness::new();
        harness.tick(0);
        harness.supplies.unreadable = true;
        for tick in 1..=u64::from(DEFAULT_CHARGER_LOSS_BUDGET) + 1 {
            let _ = harness.try_tick(tick);
        }
        assert!(harness.governor.pending_shutdown().is_some());
        harness.drain();

        harness.supplies.unreadable = false;
        let outcome = harness.tick(7);

        assert!(!outcome.low_power);
        assert!(harness.governor.pending_shutdown().is_none());
        assert_eq!(
            harness.drain(),
            [PowerEvent::VoltageGateCrossed(GateLevel::High)]
        );
    }

    #[test]
    fn charger_return_cancels_pending_loss_shutdown() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        for tick in 0..=u64::from(DEFAULT_CHARGER_LOSS_BUDGET) {
            harness.tick(tick);
        }
        assert!(harness.governor.pending_shutdown().is_some());

        harness.supplies.charger.present = true;
        harness.tick(7);
        assert!(harness.drain().contains(&PowerEvent::ChargerInserted));
        assert!(harness.governor.pending_shutdown().is_none());
        assert_eq!(harness.governor.charger_loss_ticks(), 0);

        harness.tick(30);
        assert_eq!(harness.power.power_offs(), 0);
    }

    #[test]
    fn empty_battery_confirmed_twice_powers_off() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.status = ChargeStatus::Discharging;
        harness.supplies.battery.capacity = 5;
        harness.tick(0);

        harness.supplies.battery.capacity = 0;
        harness.tick(1);
        assert_eq!(
            harness.governor.pending_shutdown().map(|p| p.reason),
            Some(ShutdownReason::BatteryEmpty)
        );

        harness.tick(3);
        assert_eq!(harness.power.power_offs(), 0);
        let outcome = harness.tick(6);
        assert_eq!(outcome.powered_off, Some(ShutdownReason::BatteryEmpty));
        assert_eq!(harness.power.power_offs(), 1);
    }

    #[test]
    fn charger_reinserted_between_checks_prevents_empty_shutdown() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.status = ChargeStatus::Discharging;
        harness.supplies.battery.capacity = 0;
        harness.tick(0);
        assert!(harness.governor.pending_shutdown().is_some());

        harness.supplies.charger.present = true;
        harness.supplies.battery.status = ChargeStatus::Charging;
        harness.tick(5);

        assert!(harness.governor.pending_shutdown().is_none());
        assert_eq!(harness.power.power_offs(), 0);
    }

    #[test]
    fn over_temperature_shuts_down_without_recheck() {
        let mut harness = Harness::new();
        harness.supplies.battery.temperature = 731;
        harness.tick(0);
        assert!(harness.drain().contains(&PowerEvent::OverTemperature));

        harness.supplies.battery.temperature = 250;
        let outcome = harness.tick(5);
        assert_eq!(outcome.powered_off, Some(ShutdownReason::OverTemperature));
    }

    #[test]
    fn over_temperature_preempts_battery_empty() {
        let mut harness = Harness::new();
        harness.supplies.charger.present = false;
        harness.supplies.battery.capacity = 0;
        harness.tick(0);
        harness.supplies.battery.temperature = 800;
        harness.tick(2);

        let pending = harness.governor.pending_shutdown().expect("pending shutdown");
        assert_eq!(pending.reason, ShutdownReason::OverTemperature);
        assert_eq!(pending.deadline, MockInstant::secs(7));
    }

    #[test]
    fn full_battery_reported_once() {
        let mut harness = Harness::new();
        harness.supplies.battery.status = ChargeStatus::Full;
        harness.tick(0);
        harness.tick(1);

        let full = harness
            .drain()
            .into_iter()
            .filter(|event| *event == PowerEvent::BatteryFull)
            .count();
        assert_eq!(full, 1);
    }
}
