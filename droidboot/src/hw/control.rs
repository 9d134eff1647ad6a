//! SCU IPC control device (`/dev/mid_ipc`).
//!
//! Every request opens the device, issues one ioctl and closes it again.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use droidboot_core::platform::{FW_REVISION_LEN, PlatformError};
use log::error;

use crate::error::{last_os_error, platform_error};

const IPC_READ_RR_FROM_OSNIB: libc::Ioctl = 0xC1;
const IPC_WRITE_RR_TO_OSNIB: libc::Ioctl = 0xC2;
const IPC_READ_VBATTCRIT: libc::Ioctl = 0xC4;
const IPC_FW_REVISION_GET: libc::Ioctl = 0xB0;

#[repr(C)]
struct ScuIpcVersion {
    count: u32,
    data: [u8; FW_REVISION_LEN],
}

/// Handle on the platform controller's ioctl interface.
#[derive(Debug, Clone)]
pub struct IpcControl {
    path: PathBuf,
}

impl IpcControl {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn open(&self) -> Result<File, PlatformError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| {
                error!("unable to open the device {}: {err}", self.path.display());
                platform_error(&err)
            })
    }

    /// Issues `request` with `arg` pointing at a caller-owned buffer.
    fn ioctl<T>(&self, request: libc::Ioctl, arg: &mut T) -> Result<(), PlatformError> {
        let device = self.open()?;
        // SAFETY: `arg` is a live, exclusively borrowed buffer sized for the
        // request and `device` keeps the descriptor open for the call.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), request, std::ptr::from_mut(arg)) };
        if rc < 0 {
            let err = last_os_error();
            error!("ioctl {request:#x} on {} failed: {err}", self.path.display());
            return Err(err);
        }
        Ok(())
    }

    pub fn read_vbattcrit(&self) -> Result<u32, PlatformError> {
        let mut word = 0u32;
        self.ioctl(IPC_READ_VBATTCRIT, &mut word)?;
        Ok(word)
    }

    pub fn read_power_on_reason(&self) -> Result<u8, PlatformError> {
        let mut reason = 0u8;
        self.ioctl(IPC_READ_RR_FROM_OSNIB, &mut reason)?;
        Ok(reason)
    }

    pub fn write_power_on_reason(&self, reason: u8) -> Result<(), PlatformError> {
        let mut reason = reason;
        self.ioctl(IPC_WRITE_RR_TO_OSNIB, &mut reason)
    }

    pub fn read_fw_revision(&self) -> Result<[u8; FW_REVISION_LEN], PlatformError> {
        let mut version = ScuIpcVersion {
            count: u32::try_from(FW_REVISION_LEN).unwrap_or(u32::MAX),
            data: [0; FW_REVISION_LEN],
        };
        self.ioctl(IPC_FW_REVISION_GET, &mut version)?;
        Ok(version.data)
    }
}
