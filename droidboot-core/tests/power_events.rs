use core::ops::Add;
use core::time::Duration;
use std::sync::Arc;

use droidboot_core::platform::{PlatformError, RecordingPowerControl};
use droidboot_core::power::governor::{GovernorConfig, PowerGovernor};
use droidboot_core::power::{
    ChargeStatus, GateLevel, LowPowerFlag, PowerEvent, PowerEventChannel, PowerStatusReader,
    PowerSupplyStatus, ShutdownReason, VoltageGate,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::PubSubChannel;

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
}

impl Supplies {
    fn on_charger(voltage_now: i32) -> Self {
        Self {
            battery: PowerSupplyStatus {
                present: true,
                voltage_now,
                capacity: 40,
                temperature: 250,
                status: ChargeStatus::Charging,
                ..PowerSupplyStatus::default()
            },
            charger: PowerSupplyStatus {
                present: true,
                ..PowerSupplyStatus::default()
            },
        }
    }

    fn unplug(&mut self) {
        self.charger.present = false;
        self.battery.status = ChargeStatus::Discharging;
    }
}

impl PowerStatusReader for Supplies {
    fn battery(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
        Ok(self.battery)
    }

    fn charger(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
        Ok(self.charger)
    }
}

fn governor(flag: &Arc<LowPowerFlag>) -> PowerGovernor<MockInstant> {
    PowerGovernor::new(
        GovernorConfig::default(),
        VoltageGate::from_microvolts(3_600_000),
        Arc::clone(flag),
    )
}

#[test]
fn events_reach_channel_subscribers() {
    static EVENTS: PowerEventChannel<CriticalSectionRawMutex> = PubSubChannel::new();
    let mut subscriber = EVENTS.subscriber().expect("subscriber slot available");
    let mut publisher = EVENTS.immediate_publisher();

    let flag = Arc::new(LowPowerFlag::new());
    let mut governor = governor(&flag);
    let mut supplies = Supplies::on_charger(3_500_000);
    let mut power = RecordingPowerControl::new();

    governor
        .tick(MockInstant::secs(0), &mut supplies, &mut publisher, &mut power)
        .expect("supplies readable");

    let mut received = Vec::new();
    while let Some(event) = subscriber.try_next_message_pure() {
        received.push(event);
    }
    assert!(received.contains(&PowerEvent::CapacityUpdate(40)));
    assert!(received.contains(&PowerEvent::VoltageGateCrossed(GateLevel::Low)));
    assert!(flag.is_low(), "battery under the gate raises the low-power flag");
}

#[test]
fn flag_follows_battery_across_the_gate() {
    let flag = Arc::new(LowPowerFlag::new());
    let mut governor = governor(&flag);
    let mut supplies = Supplies::on_charger(3_500_000);
    let mut events = Vec::new();
    let mut power = RecordingPowerControl::new();

    let outcome = governor
        .tick(MockInstant::secs(0), &mut supplies, &mut events, &mut power)
        .expect("supplies readable");
    assert!(outcome.low_power);

    supplies.battery.voltage_now = 3_700_000;
    let outcome = governor
        .tick(MockInstant::secs(1), &mut supplies, &mut events, &mut power)
        .expect("supplies readable");
    assert!(!outcome.low_power);
    assert!(!flag.is_low());
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, PowerEvent::VoltageGateCrossed(_)))
            .count(),
        2
    );
}

#[test]
fn unplugged_charger_eventually_powers_off_once() {
    let flag = Arc::new(LowPowerFlag::new());
    let mut governor = governor(&flag);
    let mut supplies = Supplies::on_charger(3_900_000);
    let mut events = Vec::new();
    let mut power = RecordingPowerControl::new();

    governor
        .tick(MockInstant::secs(0), &mut supplies, &mut events, &mut power)
        .expect("supplies readable");
    supplies.unplug();

    let mut fired = None;
    for second in 1..=30 {
        let outcome = governor
            .tick(MockInstant::secs(second), &mut supplies, &mut events, &mut power)
            .expect("supplies readable");
        if let Some(reason) = outcome.powered_off {
            fired.get_or_insert((second, reason));
        }
    }

    let (second, reason) = fired.expect("charger loss should power the device off");
    assert_eq!(reason, ShutdownReason::ChargerLost);
    assert!(second > 6, "loss budget and grace period both apply (fired at {second}s)");
    assert_eq!(power.power_offs(), 1, "power-off is issued exactly once");
    assert!(events.contains(&PowerEvent::ShutdownScheduled(ShutdownReason::ChargerLost)));
}
