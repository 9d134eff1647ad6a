//! Kernel power-supply class reader and backlight switch.
//!
//! Supplies are discovered once by scanning `<root>/*/type`; afterwards each
//! snapshot re-reads the supply's `uevent` record.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use droidboot_core::platform::PlatformError;
use droidboot_core::power::charge::Backlight;
use droidboot_core::power::{PowerStatusReader, PowerSupplyStatus, parse_uevent};
use log::{error, warn};

use crate::error::{DaemonError, platform_error};

/// Discovery attempts before giving up on a supply.
pub const DISCOVERY_ATTEMPTS: u32 = 40;
/// Delay between discovery attempts.
pub const DISCOVERY_DELAY: Duration = Duration::from_millis(100);

const BATTERY_TYPE: &str = "Battery";
const CHARGER_TYPE: &str = "USB";
const BRIGHTNESS_ON: &str = "60";
const BRIGHTNESS_OFF: &str = "0";

/// Returns the `uevent` path of the first supply whose `type` names `kind`.
fn scan(root: &Path, kind: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    entries.flatten().map(|entry| entry.path()).find_map(|supply| {
        let kind_text = fs::read_to_string(supply.join("type")).ok()?;
        kind_text
            .contains(kind)
            .then(|| supply.join("uevent"))
    })
}

/// Looks for `kind` under `root`, retrying `attempts` times `delay` apart.
pub fn discover(
    root: &Path,
    kind: &'static str,
    attempts: u32,
    delay: Duration,
) -> Result<PathBuf, DaemonError> {
    for attempt in 0..attempts {
        if let Some(path) = scan(root, kind) {
            return Ok(path);
        }
        if attempt + 1 < attempts {
            thread::sleep(delay);
        }
    }
    error!("did not find power_supply {kind}");
    Err(DaemonError::SupplyMissing(kind))
}

/// Battery and charger snapshots read from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPowerReader {
    battery: PathBuf,
    charger: PathBuf,
}

impl SysfsPowerReader {
    #[must_use]
    pub fn new(battery: PathBuf, charger: PathBuf) -> Self {
        Self { battery, charger }
    }

    /// Discovers both supplies with the stock retry budget.
    pub fn discover(root: &Path) -> Result<Self, DaemonError> {
        let battery = discover(root, BATTERY_TYPE, DISCOVERY_ATTEMPTS, DISCOVERY_DELAY)?;
        let charger = discover(root, CHARGER_TYPE, DISCOVERY_ATTEMPTS, DISCOVERY_DELAY)?;
        Ok(Self::new(battery, charger))
    }

    fn read(path: &Path) -> Result<PowerSupplyStatus, PlatformError> {
        let text = fs::read_to_string(path).map_err(|err| platform_error(&err))?;
        parse_uevent(&text).map_err(|err| {
            warn!("{}: {err}", path.display());
            PlatformError::Os(libc::EINVAL)
        })
    }
}

impl PowerStatusReader for SysfsPowerReader {
    fn battery(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
        Self::read(&self.battery)
    }

    fn charger(&mut self) -> Result<PowerSupplyStatus, PlatformError> {
        Self::read(&self.charger)
    }
}

/// Backlight driven through the first `<root>/*/brightness` attribute.
#[derive(Debug, Clone)]
pub struct SysfsBacklight {
    brightness: Option<PathBuf>,
}

impl SysfsBacklight {
    pub fn find(root: &Path) -> Self {
        let brightness = fs::read_dir(root).ok().and_then(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path().join("brightness"))
                .find(|path| path.exists())
        });
        if brightness.is_none() {
            warn!("no backlight under {}", root.display());
        }
        Self { brightness }
    }
}

impl Backlight for SysfsBacklight {
    fn set_backlight(&mut self, on: bool) {
        let Some(path) = &self.brightness else {
            return;
        };
        let value = if on { BRIGHTNESS_ON } else { BRIGHTNESS_OFF };
        if let Err(err) = fs::write(path, value) {
            error!("can't set backlight {}: {err}", path.display());
        }
    }
}
