use std::io;
use std::path::PathBuf;

use droidboot_core::ota::InstallResult;
use droidboot_core::ota::ifwi::IfwiError;
use droidboot_core::platform::PlatformError;
use thiserror::Error;

/// Failures that stop the daemon or one of its subcommands.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("IFWI update failed: {0}")]
    Ifwi(#[from] IfwiError),
    #[error("power event channel has no free subscriber slot")]
    EventChannel,
    #[error("no {0} power supply found")]
    SupplyMissing(&'static str),
    #[error("unknown boot device {0:?}")]
    UnknownBootDevice(String),
    #[error("unable to start recovery: {0}")]
    Recovery(io::Error),
    #[error("battery never charged past the voltage gate")]
    ChargeAborted,
    #[error("OTA job finished with {0:?}")]
    Ota(InstallResult),
}

/// Maps an I/O failure onto the port error reported to the core.
pub fn platform_error(err: &io::Error) -> PlatformError {
    match err.kind() {
        io::ErrorKind::NotFound => PlatformError::NotFound,
        io::ErrorKind::AlreadyExists => PlatformError::AlreadyExists,
        _ => PlatformError::Os(err.raw_os_error().unwrap_or(libc::EIO)),
    }
}

/// Reads `errno` after a failed libc call.
pub fn last_os_error() -> PlatformError {
    platform_error(&io::Error::last_os_error())
}
