//! Power key reader over the evdev character devices.

use std::fs::{self, File};
use std::io::Read;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::thread;

use droidboot_core::power::charge::KeyEvent;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, warn};

/// Depth of the key event queue.
pub const KEY_QUEUE_DEPTH: usize = 8;

/// Queue carrying power key transitions to the charge loop.
pub type KeyChannel = Channel<CriticalSectionRawMutex, KeyEvent, KEY_QUEUE_DEPTH>;

const EV_KEY: u16 = 0x01;
const KEY_POWER: u16 = 116;
const RECORD_LEN: usize = size_of::<libc::input_event>();

/// Decodes one `struct input_event`. Only power key press and release
/// records produce an event; auto-repeat is ignored.
#[must_use]
pub fn decode(record: &[u8]) -> Option<KeyEvent> {
    let tail = record.len().checked_sub(8).map(|start| &record[start..])?;
    let kind = u16::from_ne_bytes([tail[0], tail[1]]);
    let code = u16::from_ne_bytes([tail[2], tail[3]]);
    let value = i32::from_ne_bytes([tail[4], tail[5], tail[6], tail[7]]);
    if kind != EV_KEY || code != KEY_POWER {
        return None;
    }
    match value {
        1 => Some(KeyEvent::PowerPressed),
        0 => Some(KeyEvent::PowerReleased),
        _ => None,
    }
}

fn event_devices(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        warn!("no input devices under {}", dir.display());
        return Vec::new();
    };
    let mut devices: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("event"))
        .map(|entry| entry.path())
        .collect();
    devices.sort();
    devices
}

fn pump(mut device: File, name: &str, keys: &'static KeyChannel) {
    let mut record = [0u8; RECORD_LEN];
    loop {
        if let Err(err) = device.read_exact(&mut record) {
            warn!("{name}: {err}");
            return;
        }
        if let Some(event) = decode(&record) {
            debug!("{name}: {event:?}");
            if keys.try_send(event).is_err() {
                warn!("key queue full, dropping {event:?}");
            }
        }
    }
}

/// Starts one reader thread per `event*` device under `dir` and returns how
/// many were started.
pub fn spawn_readers(dir: &Path, keys: &'static KeyChannel) -> usize {
    let mut started = 0;
    for path in event_devices(dir) {
        let device = match File::open(&path) {
            Ok(device) => device,
            Err(err) => {
                warn!("{}: {err}", path.display());
                continue;
            }
        };
        let name = path.display().to_string();
        let spawned = thread::Builder::new()
            .name(format!("input-{started}"))
            .spawn(move || pump(device, &name, keys));
        match spawned {
            Ok(_) => started += 1,
            Err(err) => warn!("{}: {err}", path.display()),
        }
    }
    started
}
