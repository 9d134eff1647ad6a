//! `flash:<target>` handling.

use alloc::format;
use alloc::string::String;
use core::fmt;

use log::{error, info, warn};

use super::{Provisioner, TarballOrigin, logged_run};
use crate::fastboot::{CommandContext, Responder};
use crate::ota::ifwi::{self, IfwiOutcome};
use crate::ota::{InstallResult, OtaArgs, OtaJob, write_command_file};
use crate::partition::{MOUNT_ROOT, PartitionTable, volume};
use crate::platform::{BootSlot, Platform};
use crate::progress::{ProgressMarker, ProgressReporter};

/// Staged radio firmware.
pub const RADIO_IMAGE: &str = "/tmp/__radio.img";
/// Staged radio calibration (RnD) record.
pub const RADIO_RND_IMAGE: &str = "/tmp/__radio_rnd.img";
/// Staged download-and-execute helper for the IFWI update.
pub const DNX_IMAGE: &str = "/tmp/__dnx.bin";
/// Staged IFWI image.
pub const IFWI_IMAGE: &str = "/tmp/__ifwi.bin";
/// Archive staged before extraction into a partition.
pub const PARTITION_ARCHIVE: &str = "/tmp/_system_or_data.img";
/// Where an update package is staged before the OTA job runs.
pub const UPDATE_PACKAGE: &str = "/mnt/cache/update.zip";

const MODEM_TOOL: &str = "cmfwdl-app -t /dev/ttyMFD1 -p /dev/ttyIFX0";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

const BOOT_MAGIC: &[u8] = b"ANDROID!";
const BOOT_HEADER_LEN: usize = 48;

/// Reasons a composite boot image is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootImageError {
    /// Shorter than the fixed header.
    Truncated,
    /// Missing the `ANDROID!` magic.
    BadMagic,
    /// The kernel section is empty.
    EmptyKernel,
    /// The page size is zero or not a power of two.
    BadPageSize(u32),
    /// The sections run past the end of the payload.
    SectionsOverflow { required: u64, actual: u64 },
}

impl fmt::Display for BootImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootImageError::Truncated => f.write_str("boot image shorter than its header"),
            BootImageError::BadMagic => f.write_str("boot image magic missing"),
            BootImageError::EmptyKernel => f.write_str("boot image has no kernel"),
            BootImageError::BadPageSize(size) => write!(f, "invalid boot image page size {size}"),
            BootImageError::SectionsOverflow { required, actual } => {
                write!(f, "boot image needs {required} bytes, payload has {actual}")
            }
        }
    }
}

impl core::error::Error for BootImageError {}

fn header_word(image: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&image[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Checks the boot header of a composite image and that every section it
/// declares fits in the payload.
pub fn validate_boot_image(image: &[u8]) -> Result<(), BootImageError> {
    if image.len() < BOOT_HEADER_LEN {
        return Err(BootImageError::Truncated);
    }
    if !image.starts_with(BOOT_MAGIC) {
        return Err(BootImageError::BadMagic);
    }
    let kernel = header_word(image, 8);
    let ramdisk = header_word(image, 16);
    let second = header_word(image, 24);
    let page = header_word(image, 36);

    if kernel == 0 {
        return Err(BootImageError::EmptyKernel);
    }
    if !page.is_power_of_two() {
        return Err(BootImageError::BadPageSize(page));
    }

    let page = u64::from(page);
    let pages = |len: u32| u64::from(len).div_ceil(page) * page;
    let required = page + pages(kernel) + pages(ramdisk) + pages(second);
    let actual = image.len() as u64;
    if required > actual {
        return Err(BootImageError::SectionsOverflow { required, actual });
    }
    Ok(())
}

/// How a flash branch finished.
enum Flashed {
    /// Answer with the generic success text.
    Done,
    /// The branch already sent its terminal frame.
    Answered,
}

/// Reason sent when a branch fails without a more specific one.
const FLASH_FAILED: &str = "flash command failed";

pub(super) fn handle_flash<P: Platform>(target: &str, ctx: &mut CommandContext<'_, Provisioner<P>>) {
    info!("flash {target}: {} bytes", ctx.download.staged_length());

    let outcome = match target {
        "boot" => flash_boot(ctx, BootSlot::Main),
        "recovery" => flash_boot(ctx, BootSlot::Recovery),
        _ if ctx.payload().starts_with(ZIP_MAGIC) => Ok(flash_update_package(ctx)),
        "radio" => flash_radio(ctx, &format!("-b {RADIO_IMAGE} -f {RADIO_IMAGE}")),
        "radio_erase_all" => flash_radio(ctx, &format!("-e -b {RADIO_IMAGE} -f {RADIO_IMAGE}")),
        "rnd_erase" => flash_radio(ctx, &format!("-b {RADIO_IMAGE} --erase-rd")),
        "rnd_read" => flash_radio(ctx, &format!("-b {RADIO_IMAGE} -g")),
        "radio_img" => save_payload(ctx, RADIO_IMAGE).map(|()| Flashed::Done),
        "rnd_write" => flash_rnd_write(ctx),
        "radio_hwid" => {
            ctx.okay("Getting radio HWID...");
            flash_radio(ctx, &format!("-b {RADIO_IMAGE} -h")).map(|_| Flashed::Answered)
        }
        "dnx" => save_payload(ctx, DNX_IMAGE).map(|()| Flashed::Done),
        "ifwi" => flash_ifwi(ctx),
        path if path.starts_with('/') => save_payload(ctx, path).map(|()| Flashed::Done),
        _ => flash_partition(ctx, target),
    };

    match outcome {
        Ok(Flashed::Done) => ctx.okay("Ok"),
        Ok(Flashed::Answered) => {}
        Err(reason) => ctx.fail(reason),
    }
}

fn save_payload<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    path: &str,
) -> Result<(), &'static str> {
    let payload = ctx.download.staged();
    ctx.pipeline
        .platform
        .write_file(path, payload)
        .map_err(|err| {
            error!("cannot write {path}: {err}");
            FLASH_FAILED
        })
}

fn flash_boot<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    slot: BootSlot,
) -> Result<Flashed, &'static str> {
    let image = ctx.download.staged();
    if let Err(err) = validate_boot_image(image) {
        error!("rejecting {slot:?} image: {err}");
        return Err(FLASH_FAILED);
    }
    let platform = &mut ctx.pipeline.platform;
    platform.write_boot_image(image, slot).map_err(|err| {
        error!("cannot stitch {slot:?} image: {err}");
        FLASH_FAILED
    })?;
    if slot == BootSlot::Main {
        platform.restore_payload_entry().map_err(|err| {
            error!("cannot restore payload entry: {err}");
            FLASH_FAILED
        })?;
    }
    Ok(Flashed::Done)
}

fn remove_staged<P: Platform>(ctx: &mut CommandContext<'_, Provisioner<P>>, path: &str) {
    if let Err(err) = ctx.pipeline.platform.remove_file(path) {
        warn!("cannot remove {path}: {err}");
    }
}

fn run_staged<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    arguments: &str,
) -> Result<(), &'static str> {
    let command = format!("{MODEM_TOOL} {arguments}");
    match logged_run(ctx, &command) {
        Ok(0) => Ok(()),
        Ok(code) => {
            error!("{command} exited with {code}");
            Err(FLASH_FAILED)
        }
        Err(err) => {
            error!("{command}: {err}");
            Err(FLASH_FAILED)
        }
    }
}

fn flash_radio<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    arguments: &str,
) -> Result<Flashed, &'static str> {
    save_payload(ctx, RADIO_IMAGE)?;
    let result = run_staged(ctx, arguments);
    remove_staged(ctx, RADIO_IMAGE);
    result.map(|()| Flashed::Done)
}

fn flash_rnd_write<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
) -> Result<Flashed, &'static str> {
    if !ctx.pipeline.platform.exists(RADIO_IMAGE) {
        return Err("rnd_write --> Radio Image Not Found\nCall flash radio_img first");
    }
    save_payload(ctx, RADIO_RND_IMAGE)?;
    let result = run_staged(ctx, &format!("-b {RADIO_IMAGE} -r {RADIO_RND_IMAGE}"));
    remove_staged(ctx, RADIO_IMAGE);
    remove_staged(ctx, RADIO_RND_IMAGE);
    result.map(|()| Flashed::Done)
}

fn flash_ifwi<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
) -> Result<Flashed, &'static str> {
    if !ctx.pipeline.platform.exists(DNX_IMAGE) {
        error!("dnx binary must be flashed to board first");
        return Err(FLASH_FAILED);
    }
    save_payload(ctx, IFWI_IMAGE)?;
    let Provisioner {
        platform, config, ..
    } = &mut *ctx.pipeline;
    match ifwi::update(platform, DNX_IMAGE, IFWI_IMAGE, &config.ifwi) {
        Ok(outcome) => {
            if outcome == IfwiOutcome::Skipped {
                info!("IFWI left unchanged");
            }
            remove_staged(ctx, DNX_IMAGE);
            remove_staged(ctx, IFWI_IMAGE);
            Ok(Flashed::Done)
        }
        Err(err) => {
            error!("IFWI update failed: {err}");
            Err(FLASH_FAILED)
        }
    }
}

/// Forwards OTA status text to the host as `INFO` frames.
struct InfoProgress<'r, 'a>(&'r mut Responder<'a>);

impl ProgressReporter for InfoProgress<'_, '_> {
    fn marker(&mut self, marker: ProgressMarker) {
        info!("update package {marker:?}");
    }

    fn message(&mut self, text: &str) {
        info!("{text}");
        self.0.info(text);
    }
}

fn stage_update_package<P: Platform>(
    table: &PartitionTable,
    platform: &mut P,
    payload: &[u8],
) -> Result<(), String> {
    volume::mount_by_name(table, "cache", platform).map_err(|err| format!("cannot mount cache: {err}"))?;
    platform
        .write_file(UPDATE_PACKAGE, payload)
        .map_err(|err| format!("cannot stage update package: {err}"))?;
    let args = OtaArgs {
        update_package: Some(UPDATE_PACKAGE.into()),
        package_type: Some("ota".into()),
        ..OtaArgs::default()
    };
    write_command_file(platform, &args).map_err(|err| format!("cannot write OTA command: {err}"))
}

/// Stages an update package in the cache partition and runs the OTA job on
/// it in place.
fn flash_update_package<P: Platform>(ctx: &mut CommandContext<'_, Provisioner<P>>) -> Flashed {
    let payload = ctx.download.staged();
    let pipeline = &mut *ctx.pipeline;
    let table = &pipeline.table;
    let platform = &mut pipeline.platform;

    if let Err(reason) = stage_update_package(table, platform, payload) {
        error!("{reason}");
        let _ = volume::umount_by_name(table, "cache", platform);
        ctx.fail(FLASH_FAILED);
        return Flashed::Answered;
    }

    let job = OtaJob::new(table, pipeline.config.removable_block);
    let result = job.run(platform, &mut InfoProgress(&mut ctx.responder));
    let installed = result == InstallResult::Success
        && match platform.restore_payload_entry() {
            Ok(()) => true,
            Err(err) => {
                error!("cannot restore payload entry: {err}");
                false
            }
        };

    if volume::mount_by_name(table, "cache", platform).is_ok() {
        if let Err(err) = platform.remove_file(UPDATE_PACKAGE) {
            warn!("cannot remove {UPDATE_PACKAGE}: {err}");
        }
        let _ = volume::umount_by_name(table, "cache", platform);
    }

    if installed {
        ctx.okay("");
    } else {
        warn!("update package finished with {result:?}");
        ctx.fail("problem with flashing");
    }
    Flashed::Answered
}

/// Extracts an archive into a partition, or writes one file into it for
/// `<partition>:<path>` targets.
fn flash_partition<P: Platform>(
    ctx: &mut CommandContext<'_, Provisioner<P>>,
    target: &str,
) -> Result<Flashed, &'static str> {
    let (name, file) = match target.split_once(':') {
        Some((name, file)) => (name, Some(file.trim_start_matches('/'))),
        None => (target, None),
    };
    let payload = ctx.download.staged();
    let pipeline = &mut *ctx.pipeline;
    let Ok(entry) = pipeline.table.find(name).copied() else {
        return Err("unknown partition name");
    };
    let mount_point = entry.mount_point();

    if file.is_none() {
        pipeline
            .platform
            .write_file(PARTITION_ARCHIVE, payload)
            .map_err(|err| {
                error!("cannot stage archive: {err}");
                FLASH_FAILED
            })?;
    }

    if let Err(err) = volume::mount(&pipeline.table, &entry, &mut pipeline.platform) {
        error!("cannot mount {}: {err}", entry.name);
        return Err("fail to mount partition");
    }

    let written = match file {
        Some(file) => {
            let path = format!("{mount_point}/{file}");
            pipeline
                .platform
                .write_file(&path, payload)
                .map_err(|err| error!("cannot write {path}: {err}"))
        }
        None => {
            let root = match pipeline.origin {
                TarballOrigin::Root => MOUNT_ROOT,
                TarballOrigin::MountPoint => mount_point.as_str(),
            };
            let command = format!("tar xzf {PARTITION_ARCHIVE} -C {root}");
            let status = logged_run(ctx, &command);
            remove_staged(ctx, PARTITION_ARCHIVE);
            match status {
                Ok(0) => Ok(()),
                other => {
                    error!("{command} returned {other:?}");
                    Err(())
                }
            }
        }
    };

    if let Err(err) = volume::umount(&entry, &mut ctx.pipeline.platform) {
        error!("cannot unmount {}: {err}", entry.name);
        return Err("umount fail");
    }
    written.map(|()| Flashed::Done).map_err(|()| FLASH_FAILED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn header(kernel: u32, ramdisk: u32, page: u32, len: usize) -> Vec<u8> {
        let mut image = vec![0u8; len.max(BOOT_HEADER_LEN)];
        image[..8].copy_from_slice(BOOT_MAGIC);
        image[8..12].copy_from_slice(&kernel.to_le_bytes());
        image[16..20].copy_from_slice(&ramdisk.to_le_bytes());
        image[36..40].copy_from_slice(&page.to_le_bytes());
        image
    }

    #[test]
    fn sections_are_rounded_to_pages() {
        assert_eq!(validate_boot_image(&header(4096, 1, 4096, 3 * 4096)), Ok(()));
        assert_eq!(
            validate_boot_image(&header(4097, 1, 4096, 3 * 4096)),
            Err(BootImageError::SectionsOverflow {
                required: 4 * 4096,
                actual: 3 * 4096
            })
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(validate_boot_image(b"ANDROID!"), Err(BootImageError::Truncated));
        assert_eq!(validate_boot_image(&header(0, 0, 2048, 4096)), Err(BootImageError::EmptyKernel));
        assert_eq!(
            validate_boot_image(&header(10, 0, 3000, 9000)),
            Err(BootImageError::BadPageSize(3000))
        );

        let mut image = header(10, 0, 2048, 4096);
        image[0] = b'X';
        assert_eq!(validate_boot_image(&image), Err(BootImageError::BadMagic));
    }
}
