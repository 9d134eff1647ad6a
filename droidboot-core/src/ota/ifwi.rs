//! Integrated firmware image (IFWI) update through the SCU sysfs channels.

use alloc::string::String;
use core::fmt;

use log::{info, warn};
use winnow::ModalResult;
use winnow::ascii::{dec_uint, multispace0};
use winnow::combinator::preceded;
use winnow::error::ContextError;
use winnow::prelude::*;

use crate::boot::{FwVersion, IFWI_OFFSET};
use crate::platform::{ControlDevice, Filesystem, PlatformError};

/// Little-endian signature opening the firmware image header.
pub const FIP_SIGNATURE: u32 = 0x5049_4624;
const FIP_IFWI_MINOR: usize = 40;
const FIP_HEADER_LEN: usize = 44;

pub const DNX_CHANNEL: &str = "/sys/devices/pci0000:00/0000:00:01.7/DnX";
pub const IFWI_CHANNEL: &str = "/sys/devices/pci0000:00/0000:00:01.7/ifwi";
pub const PREPARE_RECORD: &str = "/sys/devices/pci0000:00/0000:00:01.7/scu_ipc/medfw_prepare";

/// Sysfs endpoints used by the update handshake.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IfwiChannels {
    pub dnx: String,
    pub ifwi: String,
    pub prepare: String,
}

impl Default for IfwiChannels {
    fn default() -> Self {
        Self {
            dnx: DNX_CHANNEL.into(),
            ifwi: IFWI_CHANNEL.into(),
            prepare: PREPARE_RECORD.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IfwiError {
    /// The onboard revision could not be read.
    Revision(PlatformError),
    /// The candidate image carries no firmware header.
    MissingHeader,
    /// Reading an image or writing a channel failed.
    Io(PlatformError),
    /// The prepare record could not be parsed.
    MalformedPrepare,
    /// The prepare record does not echo the staged sizes.
    SizeMismatch {
        dnx_expected: u64,
        dnx_reported: u64,
        ifwi_expected: u64,
        ifwi_reported: u64,
    },
}

impl fmt::Display for IfwiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfwiError::Revision(err) => write!(f, "unable to read onboard revision: {err}"),
            IfwiError::MissingHeader => f.write_str("firmware header not found"),
            IfwiError::Io(err) => write!(f, "firmware staging failed: {err}"),
            IfwiError::MalformedPrepare => f.write_str("malformed prepare record"),
            IfwiError::SizeMismatch {
                dnx_expected,
                dnx_reported,
                ifwi_expected,
                ifwi_reported,
            } => write!(
                f,
                "IFWI update prepare failed: dnx {dnx_reported}/{dnx_expected}, ifwi {ifwi_reported}/{ifwi_expected}"
            ),
        }
    }
}

impl core::error::Error for IfwiError {}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IfwiOutcome {
    Updated,
    /// Revisions did not call for an update.
    Skipped,
}

/// Locates the firmware header in `image` and returns its IFWI revision.
#[must_use]
pub fn image_revision(image: &[u8]) -> Option<FwVersion> {
    let signature = FIP_SIGNATURE.to_le_bytes();
    let start = image.windows(4).position(|window| window == signature)?;
    let header = image.get(start..start + FIP_HEADER_LEN)?;
    Some(FwVersion {
        minor: header[FIP_IFWI_MINOR],
        major: header[FIP_IFWI_MINOR + 1],
    })
}

/// Updates only within the same major line and to a strictly newer minor.
#[must_use]
pub fn should_update(onboard: FwVersion, candidate: FwVersion) -> bool {
    onboard.major == candidate.major && onboard.minor < candidate.minor
}

/// Sizes echoed back by the SCU after staging.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PrepareRecord {
    pub header_len: u64,
    pub ifwi_size: u64,
    pub dnx_size: u64,
}

fn prepare_record(input: &mut &str) -> ModalResult<PrepareRecord, ContextError> {
    let header_len = preceded("fupd_hdr_len=", dec_uint).parse_next(input)?;
    let ifwi_size = preceded(", fsize=", dec_uint).parse_next(input)?;
    let dnx_size = preceded(", dnx_size=", dec_uint).parse_next(input)?;
    multispace0.parse_next(input)?;
    Ok(PrepareRecord {
        header_len,
        ifwi_size,
        dnx_size,
    })
}

impl PrepareRecord {
    /// Parses `fupd_hdr_len=<n>, fsize=<n>, dnx_size=<n>`.
    pub fn parse(text: &str) -> Result<Self, IfwiError> {
        prepare_record
            .parse(text.trim_start())
            .map_err(|_| IfwiError::MalformedPrepare)
    }
}

/// Stages `dnx_path` and `ifwi_path` into the update channels when the image
/// is newer than the running firmware.
pub fn update<P>(
    ports: &mut P,
    dnx_path: &str,
    ifwi_path: &str,
    channels: &IfwiChannels,
) -> Result<IfwiOutcome, IfwiError>
where
    P: Filesystem + ControlDevice + ?Sized,
{
    let record = ports.read_fw_revision().map_err(IfwiError::Revision)?;
    let onboard = FwVersion::at(&record, IFWI_OFFSET);
    let image = ports.read_file(ifwi_path).map_err(IfwiError::Io)?;
    let candidate = image_revision(&image).ok_or(IfwiError::MissingHeader)?;
    info!("IFWI onboard revision: {onboard}, file revision: {candidate}");

    if onboard.major != candidate.major {
        warn!("IFWI major revision does not match, skipping update");
        return Ok(IfwiOutcome::Skipped);
    }
    if !should_update(onboard, candidate) {
        warn!("IFWI is up to date, skipping update");
        return Ok(IfwiOutcome::Skipped);
    }

    info!("preparing IFWI update");
    let dnx_len = ports
        .copy_file(dnx_path, &channels.dnx)
        .map_err(IfwiError::Io)?;
    ports
        .write_file(&channels.ifwi, &image)
        .map_err(IfwiError::Io)?;
    let ifwi_len = image.len() as u64;

    let text = ports.read_file(&channels.prepare).map_err(IfwiError::Io)?;
    let text = core::str::from_utf8(&text).map_err(|_| IfwiError::MalformedPrepare)?;
    let prepared = PrepareRecord::parse(text)?;
    if prepared.dnx_size != dnx_len || prepared.ifwi_size != ifwi_len {
        return Err(IfwiError::SizeMismatch {
            dnx_expected: dnx_len,
            dnx_reported: prepared.dnx_size,
            ifwi_expected: ifwi_len,
            ifwi_reported: prepared.ifwi_size,
        });
    }
    info!("IFWI update prepared");
    Ok(IfwiOutcome::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::format;
    use alloc::string::ToString;
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::platform::FW_REVISION_LEN;

    fn image(major: u8, minor: u8, padding: usize) -> Vec<u8> {
        let mut data = vec![0xaa; padding];
        let mut header = vec![0u8; FIP_HEADER_LEN];
        header[..4].copy_from_slice(&FIP_SIGNATURE.to_le_bytes());
        header[FIP_IFWI_MINOR] = minor;
        header[FIP_IFWI_MINOR + 1] = major;
        data.extend_from_slice(&header);
        data.extend_from_slice(&[0x55; 32]);
        data
    }

    #[derive(Default)]
    struct Scu {
        files: BTreeMap<String, Vec<u8>>,
        onboard: [u8; FW_REVISION_LEN],
        echo_dnx: Option<u64>,
    }

    impl Scu {
        fn with_onboard(major: u8, minor: u8) -> Self {
            let mut onboard = [0; FW_REVISION_LEN];
            onboard[IFWI_OFFSET] = major;
            onboard[IFWI_OFFSET - 1] = minor;
            Self {
                onboard,
                ..Self::default()
            }
        }
    }

    impl Filesystem for Scu {
        fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), PlatformError> {
            self.files.insert(path.to_string(), data.to_vec());
            Ok(())
        }

        fn read_file(&mut self, path: &str) -> Result<Vec<u8>, PlatformError> {
            if path == PREPARE_RECORD {
                let dnx = self.files.get(DNX_CHANNEL).map_or(0, Vec::len) as u64;
                let ifwi = self.files.get(IFWI_CHANNEL).map_or(0, Vec::len) as u64;
                let dnx = self.echo_dnx.unwrap_or(dnx);
                return Ok(format!("fupd_hdr_len=24, fsize={ifwi}, dnx_size={dnx}\n").into_bytes());
            }
            self.files.get(path).cloned().ok_or(PlatformError::NotFound)
        }

        fn exists(&self, path: &str) -> bool {
            self.files.contains_key(path)
        }

        fn remove_file(&mut self, path: &str) -> Result<(), PlatformError> {
            self.files.remove(path).map(|_| ()).ok_or(PlatformError::NotFound)
        }

        fn create_dir(&mut self, _: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        fn file_len(&self, path: &str) -> Result<u64, PlatformError> {
            self.files
                .get(path)
                .map(|data| data.len() as u64)
                .ok_or(PlatformError::NotFound)
        }
    }

    impl ControlDevice for Scu {
        fn read_vbattcrit(&mut self) -> Result<u32, PlatformError> {
            Ok(0)
        }

        fn read_power_on_reason(&mut self) -> Result<u8, PlatformError> {
            Ok(0)
        }

        fn write_power_on_reason(&mut self, _: u8) -> Result<(), PlatformError> {
            Ok(())
        }

        fn read_fw_revision(&mut self) -> Result<[u8; FW_REVISION_LEN], PlatformError> {
            Ok(self.onboard)
        }
    }

    fn staged(scu: &mut Scu, ifwi: Vec<u8>) {
        scu.files.insert("/tmp/__dnx.bin".to_string(), vec![1; 100]);
        scu.files.insert("/tmp/__ifwi.bin".to_string(), ifwi);
    }

    #[test]
    fn finds_revision_behind_padding() {
        assert_eq!(
            image_revision(&image(0x0a, 0x05, 123)),
            Some(FwVersion { major: 0x0a, minor: 0x05 })
        );
        assert_eq!(image_revision(&[0u8; 64]), None);

        let mut truncated = image(1, 1, 0);
        truncated.truncate(FIP_HEADER_LEN - 1);
        assert_eq!(image_revision(&truncated), None);
    }

    #[test]
    fn only_newer_minor_in_same_major_updates() {
        let onboard = FwVersion { major: 3, minor: 4 };
        assert!(should_update(onboard, FwVersion { major: 3, minor: 5 }));
        assert!(!should_update(onboard, FwVersion { major: 3, minor: 4 }));
        assert!(!should_update(onboard, FwVersion { major: 2, minor: 9 }));
        assert!(!should_update(onboard, FwVersion { major: 4, minor: 0 }));
    }

    #[test]
    fn parses_prepare_record() {
        assert_eq!(
            PrepareRecord::parse("fupd_hdr_len=24, fsize=4096, dnx_size=100\n"),
            Ok(PrepareRecord {
                header_len: 24,
                ifwi_size: 4096,
                dnx_size: 100
            })
        );
        assert_eq!(
            PrepareRecord::parse("fsize=1"),
            Err(IfwiError::MalformedPrepare)
        );
    }

    #[test]
    fn stages_newer_image() {
        let mut scu = Scu::with_onboard(3, 4);
        let ifwi = image(3, 5, 16);
        staged(&mut scu, ifwi.clone());

        let outcome = update(&mut scu, "/tmp/__dnx.bin", "/tmp/__ifwi.bin", &IfwiChannels::default());

        assert_eq!(outcome, Ok(IfwiOutcome::Updated));
        assert_eq!(scu.files.get(IFWI_CHANNEL), Some(&ifwi));
        assert_eq!(scu.files.get(DNX_CHANNEL).map(Vec::len), Some(100));
    }

    #[test]
    fn older_or_foreign_image_is_skipped() {
        for (major, minor) in [(3, 4), (3, 1), (2, 9), (4, 0)] {
            let mut scu = Scu::with_onboard(3, 4);
            staged(&mut scu, image(major, minor, 0));

            let outcome =
                update(&mut scu, "/tmp/__dnx.bin", "/tmp/__ifwi.bin", &IfwiChannels::default());

            assert_eq!(outcome, Ok(IfwiOutcome::Skipped));
            assert!(!scu.files.contains_key(DNX_CHANNEL));
        }
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut scu = Scu::with_onboard(3, 4);
        scu.echo_dnx = Some(99);
        staged(&mut scu, image(3, 6, 0));

        let outcome = update(&mut scu, "/tmp/__dnx.bin", "/tmp/__ifwi.bin", &IfwiChannels::default());

        assert!(matches!(
            outcome,
            Err(IfwiError::SizeMismatch {
                dnx_expected: 100,
                dnx_reported: 99,
                ..
            })
        ));
    }
}
