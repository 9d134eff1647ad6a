//! In-memory platform used by the emulator and the test suites.
//!
//! Files, mounts and properties live in maps; shell commands are recorded and
//! answered from a script of exit codes and output keyed by command prefix.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::fastboot::{Transport, TransportError};
use crate::platform::{
    BootImageWriter, BootSlot, ControlDevice, FW_REVISION_LEN, Filesystem, Mounter, PlatformError,
    PowerControl, ProcessRunner, PropertyStore, RecordingPowerControl, RestartMode,
};

/// Default VBATTCRIT word: 3.6 V in millivolts.
pub const SIM_VBATTCRIT: u32 = 3600;

/// Scripted reply for commands starting with a prefix.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct Reply {
    prefix: String,
    exit_code: i32,
    output: String,
}

/// Active mount as seen by [`SimPlatform`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimMount {
    pub device: String,
    pub fs_type: String,
}

/// Platform double with observable side effects.
#[derive(Clone, Debug)]
pub struct SimPlatform {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    mounts: BTreeMap<String, SimMount>,
    broken_devices: BTreeSet<String>,
    replies: Vec<Reply>,
    commands: Vec<String>,
    properties: BTreeMap<String, String>,
    boot_images: Vec<(BootSlot, Vec<u8>)>,
    payload_restores: usize,
    power_on_reason: u8,
    vbattcrit: Option<u32>,
    fw_revision: [u8; FW_REVISION_LEN],
    power: RecordingPowerControl,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            mounts: BTreeMap::new(),
            broken_devices: BTreeSet::new(),
            replies: Vec::new(),
            commands: Vec::new(),
            properties: BTreeMap::new(),
            boot_images: Vec::new(),
            payload_restores: 0,
            power_on_reason: 0x0e,
            vbattcrit: Some(SIM_VBATTCRIT),
            fw_revision: [0; FW_REVISION_LEN],
            power: RecordingPowerControl::new(),
        }
    }

    /// Seeds a file.
    #[must_use]
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(path.to_string(), data.to_vec());
        self
    }

    /// Commands starting with `prefix` exit with `exit_code` and print
    /// `output`. Later scripts win over earlier ones.
    pub fn script(&mut self, prefix: &str, exit_code: i32, output: &str) {
        self.replies.push(Reply {
            prefix: prefix.to_string(),
            exit_code,
            output: output.to_string(),
        });
    }

    /// Makes every mount of `device` fail.
    pub fn break_device(&mut self, device: &str) {
        self.broken_devices.insert(device.to_string());
    }

    pub fn set_power_on_reason(&mut self, code: u8) {
        self.power_on_reason = code;
    }

    /// `None` makes the calibration word unreadable.
    pub fn set_vbattcrit(&mut self, word: Option<u32>) {
        self.vbattcrit = word;
    }

    pub fn set_fw_revision(&mut self, record: [u8; FW_REVISION_LEN]) {
        self.fw_revision = record;
    }

    #[must_use]
    pub const fn power_on_reason(&self) -> u8 {
        self.power_on_reason
    }

    /// Contents of `path`, if present.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Every command run so far, in order.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Mount active on `target`.
    #[must_use]
    pub fn mount_at(&self, target: &str) -> Option<&SimMount> {
        self.mounts.get(target)
    }

    #[must_use]
    pub fn is_mounted(&self, target: &str) -> bool {
        self.mounts.contains_key(target)
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Images handed to the stitching primitive.
    #[must_use]
    pub fn boot_images(&self) -> &[(BootSlot, Vec<u8>)] {
        &self.boot_images
    }

    #[must_use]
    pub const fn payload_restores(&self) -> usize {
        self.payload_restores
    }

    #[must_use]
    pub const fn power(&self) -> &RecordingPowerControl {
        &self.power
    }

    fn reply(&self, command: &str) -> Option<&Reply> {
        self.replies
            .iter()
            .rev()
            .find(|reply| command.starts_with(&reply.prefix))
    }
}

impl ProcessRunner for SimPlatform {
    fn run(&mut self, command: &str) -> Result<i32, PlatformError> {
        self.run_streaming(command, &mut |_| {})
    }

    fn run_streaming(
        &mut self,
        command: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<i32, PlatformError> {
        self.commands.push(command.to_string());
        let Some(reply) = self.reply(command) else {
            return Ok(0);
        };
        for line in reply.output.lines() {
            sink(line);
        }
        Ok(reply.exit_code)
    }
}

impl Filesystem for SimPlatform {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), PlatformError> {
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, PlatformError> {
        self.files.get(path).cloned().ok_or(PlatformError::NotFound)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn remove_file(&mut self, path: &str) -> Result<(), PlatformError> {
        self.files
            .remove(path)
            .map(|_| ())
            .ok_or(PlatformError::NotFound)
    }

    fn create_dir(&mut self, path: &str) -> Result<(), PlatformError> {
        if self.dirs.insert(path.to_string()) {
            Ok(())
        } else {
            Err(PlatformError::AlreadyExists)
        }
    }

    fn file_len(&self, path: &str) -> Result<u64, PlatformError> {
        self.files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or(PlatformError::NotFound)
    }
}

impl Mounter for SimPlatform {
    fn mount(&mut self, device: &str, target: &str, fs_type: &str) -> Result<(), PlatformError> {
        if self.broken_devices.contains(device) {
            return Err(PlatformError::NotFound);
        }
        if self.mounts.contains_key(target) {
            return Err(PlatformError::Os(16));
        }
        self.mounts.insert(
            target.to_string(),
            SimMount {
                device: device.to_string(),
                fs_type: fs_type.to_string(),
            },
        );
        Ok(())
    }

    fn umount(&mut self, target: &str) -> Result<(), PlatformError> {
        self.mounts
            .remove(target)
            .map(|_| ())
            .ok_or(PlatformError::NotMounted)
    }
}

impl ControlDevice for SimPlatform {
    fn read_vbattcrit(&mut self) -> Result<u32, PlatformError> {
        self.vbattcrit.ok_or(PlatformError::NotFound)
    }

    fn read_power_on_reason(&mut self) -> Result<u8, PlatformError> {
        Ok(self.power_on_reason)
    }

    fn write_power_on_reason(&mut self, reason: u8) -> Result<(), PlatformError> {
        self.power_on_reason = reason;
        Ok(())
    }

    fn read_fw_revision(&mut self) -> Result<[u8; FW_REVISION_LEN], PlatformError> {
        Ok(self.fw_revision)
    }
}

impl BootImageWriter for SimPlatform {
    fn write_boot_image(&mut self, image: &[u8], slot: BootSlot) -> Result<(), PlatformError> {
        self.boot_images.push((slot, image.to_vec()));
        Ok(())
    }

    fn restore_payload_entry(&mut self) -> Result<(), PlatformError> {
        self.payload_restores += 1;
        Ok(())
    }
}

impl PropertyStore for SimPlatform {
    fn set_property(&mut self, key: &str, value: &str) -> Result<(), PlatformError> {
        self.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl PowerControl for SimPlatform {
    fn power_off(&mut self) {
        self.power.power_off();
    }

    fn restart(&mut self, mode: RestartMode) {
        self.power.restart(mode);
    }
}

/// Transport fed from a queue of host packets. Every frame the device writes
/// is kept for inspection. An empty queue reads as a disconnect.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    incoming: VecDeque<Vec<u8>>,
    outgoing: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one host packet (or download chunk).
    pub fn push(&mut self, packet: &[u8]) {
        self.incoming.push_back(packet.to_vec());
    }

    /// Queues a `download:` command followed by its payload.
    pub fn push_download(&mut self, payload: &[u8]) {
        self.push(alloc::format!("download:{:08x}", payload.len()).as_bytes());
        self.push(payload);
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.outgoing
    }

    /// Frames written so far, decoded lossily as text.
    #[must_use]
    pub fn replies(&self) -> Vec<String> {
        self.outgoing
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Drains the frames written so far.
    pub fn take_replies(&mut self) -> Vec<String> {
        let replies = self.replies();
        self.outgoing.clear();
        replies
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let Some(mut chunk) = self.incoming.pop_front() else {
            return Ok(0);
        };
        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        if len < chunk.len() {
            self.incoming.push_front(chunk.split_off(len));
        }
        Ok(len)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.outgoing.push(data.to_vec());
        Ok(())
    }
}
