use droidboot_core::fastboot::{AdmissionGate, Engine};
use droidboot_core::ota::InstallResult;
use droidboot_core::platform::PropertyStore;
use droidboot_core::progress::ProgressObserver;
use droidboot_core::provision::Provisioner;
use log::{info, warn};

use crate::config::DaemonConfig;
use crate::hw::LinuxPlatform;
use crate::progress::ProgressFile;
use crate::usb::GadgetProvider;

/// Runs the persisted OTA request. Returns `true` when it installed and the
/// device is restarting.
pub fn trigger_ota(config: &DaemonConfig, provisioner: &mut Provisioner<LinuxPlatform>) -> bool {
    let mut progress = ProgressFile::new(config.paths.progress_file.clone());
    let result = provisioner.run_pending_ota(&mut progress);
    info!("OTA job: {result:?}");
    if result == InstallResult::Success {
        info!("OTA update successfully, reboot to Android system...");
        provisioner.reboot_android();
        return true;
    }
    false
}

/// Serves fastboot sessions on the USB gadget for as long as it reappears.
pub fn serve<G: AdmissionGate>(
    config: &DaemonConfig,
    mut provisioner: Provisioner<LinuxPlatform>,
    gate: G,
) {
    let mut engine = Engine::new(config.download_capacity, gate);
    provisioner.install(&mut engine);
    if let Err(err) = provisioner
        .platform_mut()
        .set_property("sys.usb.config", "adb")
    {
        warn!("unable to select the adb gadget: {err}");
    }
    info!("Listening for the fastboot protocol on the USB OTG.");

    let mut provider = GadgetProvider::new(
        config.paths.enable_device.clone(),
        config.paths.transport_device.clone(),
    );
    let mut observer = ProgressObserver(ProgressFile::new(config.paths.progress_file.clone()));
    engine.serve(&mut provider, &mut provisioner, &mut observer);
}
