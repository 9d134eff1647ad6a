//! Android USB gadget transport.
//!
//! The gadget function is switched on through its `enable` node, then the
//! data character device carries the fastboot protocol. Both handles stay
//! open for the lifetime of a session and are closed together when the host
//! goes away.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use droidboot_core::fastboot::{Transport, TransportError, TransportProvider};
use log::{debug, info};

/// Delay before each open attempt.
pub const OPEN_RETRY: Duration = Duration::from_secs(1);

fn transport_error(err: &io::Error) -> TransportError {
    TransportError::Io(err.raw_os_error().unwrap_or(libc::EIO))
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Open gadget session.
#[derive(Debug)]
pub struct GadgetTransport {
    data: File,
    _enable: File,
}

impl Transport for GadgetTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.data.read(buf).map_err(|err| transport_error(&err))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.data
            .write_all(data)
            .map_err(|err| transport_error(&err))
    }
}

/// Re-opens the gadget for every session.
#[derive(Debug, Clone)]
pub struct GadgetProvider {
    enable: PathBuf,
    data: PathBuf,
    retry: Duration,
    attempts: Option<u32>,
}

impl GadgetProvider {
    /// Provider that keeps retrying forever.
    #[must_use]
    pub fn new(enable: PathBuf, data: PathBuf) -> Self {
        Self {
            enable,
            data,
            retry: OPEN_RETRY,
            attempts: None,
        }
    }

    /// Limits the number of open attempts.
    #[cfg(test)]
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, retry: Duration) -> Self {
        self.attempts = Some(attempts);
        self.retry = retry;
        self
    }

    fn try_open(&self) -> Option<GadgetTransport> {
        thread::sleep(self.retry);
        let enable = match open_rw(&self.enable) {
            Ok(enable) => enable,
            Err(err) => {
                debug!("{}: {err}", self.enable.display());
                return None;
            }
        };
        thread::sleep(self.retry);
        match open_rw(&self.data) {
            Ok(data) => Some(GadgetTransport {
                data,
                _enable: enable,
            }),
            Err(err) => {
                debug!("{}: {err}", self.data.display());
                None
            }
        }
    }
}

impl TransportProvider for GadgetProvider {
    type Transport = GadgetTransport;

    fn open(&mut self) -> Option<GadgetTransport> {
        loop {
            if let Some(left) = self.attempts.as_mut() {
                if *left == 0 {
                    return None;
                }
                *left -= 1;
            }
            if let Some(transport) = self.try_open() {
                info!("FASTBOOT ONLINE.");
                return Some(transport);
            }
        }
    }
}
