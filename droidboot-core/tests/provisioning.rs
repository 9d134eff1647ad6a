use std::sync::Arc;

use droidboot_core::fastboot::{Engine, NoopObserver};
use droidboot_core::ota::{COMMAND_FILE, INTENT_FILE};
use droidboot_core::partition::PartitionTable;
use droidboot_core::power::LowPowerFlag;
use droidboot_core::progress::{ProgressMarker, ProgressObserver, RecordedProgress};
use droidboot_core::provision::flash::UPDATE_PACKAGE;
use droidboot_core::provision::{ProvisionConfig, Provisioner};
use droidboot_core::sim::{ScriptedTransport, SimPlatform};

type GatedEngine = Engine<Provisioner<SimPlatform>, Arc<LowPowerFlag>>;

fn setup(platform: SimPlatform) -> (GatedEngine, Provisioner<SimPlatform>, Arc<LowPowerFlag>) {
    let flag = Arc::new(LowPowerFlag::new());
    let mut engine = Engine::new(1 << 16, Arc::clone(&flag));
    let mut provisioner = Provisioner::new(
        platform,
        PartitionTable::default(),
        ProvisionConfig::default(),
    );
    provisioner.install(&mut engine);
    (engine, provisioner, flag)
}

fn session(
    engine: &mut GatedEngine,
    provisioner: &mut Provisioner<SimPlatform>,
    transport: &mut ScriptedTransport,
) -> Vec<String> {
    engine.run_session(transport, provisioner, &mut NoopObserver);
    transport.take_replies()
}

fn update_package() -> Vec<u8> {
    let mut zip = b"PK\x03\x04".to_vec();
    zip.extend_from_slice(&[0x20; 512]);
    zip
}

#[test]
fn low_power_refuses_every_matched_command() {
    let (mut engine, mut provisioner, flag) = setup(SimPlatform::new());
    let mut transport = ScriptedTransport::new();
    flag.set(true);
    transport.push(b"erase:data");
    transport.push(b"getvar:version");
    transport.push(b"frobnicate");

    assert_eq!(
        session(&mut engine, &mut provisioner, &mut transport),
        [
            "FAILbattery too low",
            "FAILbattery too low",
            "FAILunknown command"
        ]
    );
    assert!(provisioner.platform().commands().is_empty());

    flag.set(false);
    transport.push(b"erase:data");
    assert_eq!(
        session(&mut engine, &mut provisioner, &mut transport),
        ["OKAY"]
    );
}

#[test]
fn update_package_flash_runs_install_in_place() {
    let (mut engine, mut provisioner, _) = setup(SimPlatform::new());
    let mut transport = ScriptedTransport::new();
    transport.push_download(&update_package());
    transport.push(b"flash:update");

    let replies = session(&mut engine, &mut provisioner, &mut transport);

    assert_eq!(replies.last().map(String::as_str), Some("OKAY"));
    assert!(
        replies.iter().any(|reply| reply == "INFOclean user data."),
        "install progress should reach the host: {replies:?}"
    );
    let platform = provisioner.platform();
    assert!(platform.commands().iter().any(|ran| ran
        == "/chaabi/signed_image_verify.out -f /mnt/cache/update.zip"));
    assert_eq!(platform.payload_restores(), 1);
    assert_eq!(platform.file(UPDATE_PACKAGE), None, "staged package is removed");
    assert_eq!(platform.file(COMMAND_FILE), None);
    assert_eq!(platform.file(INTENT_FILE), Some(&b"--result=success"[..]));
    assert!(!platform.is_mounted("/mnt/cache"));
}

#[test]
fn rejected_update_package_reports_problem() {
    let mut platform = SimPlatform::new();
    platform.script("/chaabi/signed_image_verify.out", 1, "");
    let (mut engine, mut provisioner, _) = setup(platform);
    let mut transport = ScriptedTransport::new();
    transport.push_download(&update_package());
    transport.push(b"flash:update");

    let replies = session(&mut engine, &mut provisioner, &mut transport);

    assert_eq!(
        replies.last().map(String::as_str),
        Some("FAILproblem with flashing")
    );
    assert_eq!(provisioner.platform().payload_restores(), 0);
    assert_eq!(provisioner.platform().file(UPDATE_PACKAGE), None);
}

#[test]
fn progress_markers_bracket_each_command() {
    let (mut engine, mut provisioner, _) = setup(SimPlatform::new());
    let mut transport = ScriptedTransport::new();
    transport.push(b"getvar:product");
    transport.push(b"oem log_enable");
    let mut observer = ProgressObserver(RecordedProgress::default());

    engine.run_session(&mut transport, &mut provisioner, &mut observer);

    assert_eq!(
        observer.0.markers(),
        [
            ProgressMarker::Start,
            ProgressMarker::Finish,
            ProgressMarker::Start,
            ProgressMarker::Finish
        ]
    );
}

#[test]
fn session_survives_failures_and_reconnects() {
    let (mut engine, mut provisioner, _) = setup(SimPlatform::new());
    let mut transport = ScriptedTransport::new();
    transport.push(b"flash:bogus");
    transport.push(b"oem bootdev nand");

    assert_eq!(
        session(&mut engine, &mut provisioner, &mut transport),
        ["FAILunknown partition name", "OKAY"]
    );

    transport.push(b"getvar:bootdev");
    assert_eq!(
        session(&mut engine, &mut provisioner, &mut transport),
        ["OKAYnand"],
        "state published in one session survives into the next"
    );
}
