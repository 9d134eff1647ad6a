use droidboot_core::ota::{
    COMMAND_FILE, INTENT_FILE, InstallResult, OtaArgs, OtaJob, WIPE_MARKER, write_command_file,
};
use droidboot_core::partition::PartitionTable;
use droidboot_core::progress::{ProgressMarker, RecordedProgress};
use droidboot_core::sim::SimPlatform;

const DATA_FORMAT: &str = "mkfs.ext4 -L data /dev/mmcblk0p2";

fn platform_with_job(args: &OtaArgs) -> SimPlatform {
    let mut platform = SimPlatform::new();
    write_command_file(&mut platform, args).expect("sim filesystem accepts writes");
    platform
}

fn run(platform: &mut SimPlatform) -> (InstallResult, RecordedProgress) {
    let table = PartitionTable::default();
    let mut progress = RecordedProgress::default();
    let result = OtaJob::new(&table, None).run(platform, &mut progress);
    (result, progress)
}

fn intent(platform: &SimPlatform) -> Option<String> {
    platform
        .file(INTENT_FILE)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn count(platform: &SimPlatform, command: &str) -> usize {
    platform
        .commands()
        .iter()
        .filter(|ran| ran.as_str() == command)
        .count()
}

#[test]
fn wipe_data_erases_and_boots_main_os() {
    let mut platform = platform_with_job(&OtaArgs {
        wipe_data: true,
        ..OtaArgs::default()
    });

    let (result, progress) = run(&mut platform);

    assert_eq!(result, InstallResult::Success);
    assert_eq!(count(&platform, DATA_FORMAT), 1);
    assert_eq!(count(&platform, "update_osip --restore"), 2);
    assert_eq!(platform.power_on_reason(), 0x00);
    assert_eq!(intent(&platform).as_deref(), Some("--result=success"));
    assert_eq!(platform.file(COMMAND_FILE), None, "command file must not replay");
    assert_eq!(platform.file(WIPE_MARKER), None);
    assert!(!platform.is_mounted("/mnt/cache"));
    assert_eq!(
        progress.markers(),
        [ProgressMarker::Start, ProgressMarker::Finish]
    );
}

#[test]
fn retried_job_skips_completed_wipe() {
    let mut platform = platform_with_job(&OtaArgs {
        wipe_data: true,
        ..OtaArgs::default()
    })
    .with_file(WIPE_MARKER, b"");

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Success);
    assert_eq!(
        count(&platform, DATA_FORMAT),
        0,
        "a wipe recorded by the marker must not run twice"
    );
    assert_eq!(platform.file(WIPE_MARKER), None);
}

#[test]
fn missing_command_file_is_an_interrupt() {
    let mut platform = SimPlatform::new();

    let (result, progress) = run(&mut platform);

    assert_eq!(result, InstallResult::Interrupt);
    assert_eq!(intent(&platform), None);
    assert!(progress.markers().is_empty());
    assert!(!platform.is_mounted("/mnt/cache"));
}

#[test]
fn empty_request_aborts_and_records_failure() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/update.zip".into()),
        ..OtaArgs::default()
    });

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Abort);
    assert_eq!(
        intent(&platform).as_deref(),
        Some("--result=fail\n--extra=nothing to install")
    );
}

#[test]
fn failed_verification_is_corrupt_and_keeps_data() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/update.zip".into()),
        package_type: Some("ota".into()),
        ..OtaArgs::default()
    });
    platform.script("/chaabi/signed_image_verify.out", 1, "");

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Corrupt);
    assert_eq!(count(&platform, DATA_FORMAT), 0);
    assert_eq!(
        intent(&platform).as_deref(),
        Some("--result=fail\n--extra=package verification failed")
    );
    assert_eq!(platform.file(COMMAND_FILE), None);
}

#[test]
fn ota_package_installs_from_sdcard_partition() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/update.zip".into()),
        package_type: Some("ota".into()),
        ..OtaArgs::default()
    });

    let (result, progress) = run(&mut platform);

    assert_eq!(result, InstallResult::Success);
    let commands = platform.commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|ran| ran == needle)
            .unwrap_or_else(|| panic!("{needle} was not run: {commands:?}"))
    };
    let verify = position("/chaabi/signed_image_verify.out -f /mnt/sdcard/update.zip");
    let mount = position("mount /mnt/sdcard/update.zip /update -t iso9660 -o loop");
    let wipe = position(DATA_FORMAT);
    let setup = position("/bin/sh /update/setup.sh");
    assert!(verify < mount && mount < wipe && wipe < setup);
    assert!(!platform.is_mounted("/mnt/sdcard"));
    assert!(!platform.is_mounted("/mnt/system"));
    assert!(progress.entries.len() > 2);
}

#[test]
fn removable_card_install_requires_detected_card() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/update.zip".into()),
        package_type: Some("ota".into()),
        sdcard: true,
        ..OtaArgs::default()
    });

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Error);
    assert_eq!(
        intent(&platform).as_deref(),
        Some("--result=fail\n--extra=sdcard unavailable")
    );
}

#[test]
fn removable_card_is_mounted_from_detected_block() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/update.zip".into()),
        package_type: Some("ota".into()),
        sdcard: true,
        ..OtaArgs::default()
    });
    let table = PartitionTable::default();

    let result = OtaJob::new(&table, Some(1)).run(&mut platform, &mut RecordedProgress::default());

    assert_eq!(result, InstallResult::Success);
    assert!(!platform.is_mounted("/mnt/sdcard"), "card must be released after install");
}

#[test]
fn fota_package_is_accepted_without_install() {
    let mut platform = platform_with_job(&OtaArgs {
        update_package: Some("/mnt/sdcard/modem.fota".into()),
        package_type: Some("fota".into()),
        ..OtaArgs::default()
    });

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Success);
    assert_eq!(count(&platform, DATA_FORMAT), 0);
}

#[test]
fn factory_restore_replays_factory_image() {
    let mut platform = platform_with_job(&OtaArgs {
        factory_restore: true,
        ..OtaArgs::default()
    });

    let (result, _) = run(&mut platform);

    assert_eq!(result, InstallResult::Success);
    assert_eq!(
        count(
            &platform,
            "mount /mnt/factory/factory_restore.iso /update -t iso9660 -o loop"
        ),
        1
    );
    assert_eq!(count(&platform, DATA_FORMAT), 1);
    assert!(!platform.is_mounted("/mnt/factory"));
}
