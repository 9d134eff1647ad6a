//! Processes, files, mounts, properties and power transitions.

use std::ffi::CString;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use droidboot_core::platform::{
    BootImageWriter, BootSlot, ControlDevice, FW_REVISION_LEN, Filesystem, Mounter, PlatformError,
    PowerControl, ProcessRunner, PropertyStore, RestartMode,
};
use log::{debug, error, info};

use super::control::IpcControl;
use crate::config::Tools;
use crate::error::{last_os_error, platform_error};

const SHELL: &str = "/bin/sh";

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn c_string(text: &str) -> Result<CString, PlatformError> {
    CString::new(text).map_err(|_| PlatformError::Os(libc::EINVAL))
}

/// `sync(2)` followed by `reboot(2)`.
#[derive(Debug, Clone)]
pub struct Reboot {
    force_shutdown: PathBuf,
}

impl Reboot {
    #[must_use]
    pub fn new(force_shutdown: PathBuf) -> Self {
        Self { force_shutdown }
    }
}

impl PowerControl for Reboot {
    fn power_off(&mut self) {
        info!("force shutdown");
        if let Err(err) = fs::write(&self.force_shutdown, b"1") {
            error!("can't flag shutdown in {}: {err}", self.force_shutdown.display());
        }
        // SAFETY: no arguments; flushes dirty buffers before power-off.
        unsafe { libc::sync() };
        // SAFETY: plain power-off request with no pointer arguments.
        if unsafe { libc::reboot(libc::LINUX_REBOOT_CMD_POWER_OFF) } < 0 {
            error!("power off failed: {}", last_os_error());
        }
    }

    fn restart(&mut self, mode: RestartMode) {
        info!("restarting into {mode}");
        let Ok(argument) = c_string(mode.as_str()) else {
            return;
        };
        // SAFETY: no arguments; flushes dirty buffers before the restart.
        unsafe { libc::sync() };
        // SAFETY: `argument` is a NUL-terminated string that outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_reboot,
                libc::LINUX_REBOOT_MAGIC1,
                libc::LINUX_REBOOT_MAGIC2,
                libc::LINUX_REBOOT_CMD_RESTART2,
                argument.as_ptr(),
            )
        };
        if rc < 0 {
            error!("restart into {mode} failed: {}", last_os_error());
        }
    }
}

/// Every platform port backed by the running Linux system.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    control: IpcControl,
    reboot: Reboot,
    tools: Tools,
}

impl LinuxPlatform {
    #[must_use]
    pub fn new(control: IpcControl, reboot: Reboot, tools: Tools) -> Self {
        Self {
            control,
            reboot,
            tools,
        }
    }

    fn run_tool(&mut self, command: &str) -> Result<(), PlatformError> {
        match self.run(command)? {
            0 => Ok(()),
            code => {
                error!("{command}: exit {code}");
                Err(PlatformError::Os(libc::EIO))
            }
        }
    }
}

impl ProcessRunner for LinuxPlatform {
    fn run(&mut self, command: &str) -> Result<i32, PlatformError> {
        debug!("sh -c {command}");
        let status = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .status()
            .map_err(|err| platform_error(&err))?;
        Ok(exit_code(status))
    }

    fn run_streaming(
        &mut self,
        command: &str,
        sink: &mut dyn FnMut(&str),
    ) -> Result<i32, PlatformError> {
        debug!("sh -c {command} (streaming)");
        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(format!("{{ {command}\n}} 2>&1"))
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| platform_error(&err))?;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => sink(&line),
                    Err(err) => {
                        error!("reading output of {command}: {err}");
                        break;
                    }
                }
            }
        }
        let status = child.wait().map_err(|err| platform_error(&err))?;
        Ok(exit_code(status))
    }
}

impl Filesystem for LinuxPlatform {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), PlatformError> {
        fs::write(path, data).map_err(|err| platform_error(&err))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, PlatformError> {
        fs::read(path).map_err(|err| platform_error(&err))
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn remove_file(&mut self, path: &str) -> Result<(), PlatformError> {
        fs::remove_file(path).map_err(|err| platform_error(&err))
    }

    fn create_dir(&mut self, path: &str) -> Result<(), PlatformError> {
        fs::create_dir(path).map_err(|err| platform_error(&err))
    }

    fn file_len(&self, path: &str) -> Result<u64, PlatformError> {
        fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|err| platform_error(&err))
    }

    fn copy_file(&mut self, from: &str, to: &str) -> Result<u64, PlatformError> {
        fs::copy(from, to).map_err(|err| platform_error(&err))
    }
}

impl Mounter for LinuxPlatform {
    fn mount(&mut self, device: &str, target: &str, fs_type: &str) -> Result<(), PlatformError> {
        // Network sources carry their own options and go through mount(8).
        if device.contains(char::is_whitespace) {
            return self.run_tool(&format!("mount -t {fs_type} {device} {target}"));
        }
        let source = c_string(device)?;
        let dir = c_string(target)?;
        let kind = c_string(fs_type)?;
        // SAFETY: all strings are NUL-terminated and live across the call;
        // a null data pointer means "no options".
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                dir.as_ptr(),
                kind.as_ptr(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    fn umount(&mut self, target: &str) -> Result<(), PlatformError> {
        let dir = c_string(target)?;
        // SAFETY: `dir` is NUL-terminated and outlives the call.
        if unsafe { libc::umount(dir.as_ptr()) } < 0 {
            return match last_os_error() {
                PlatformError::Os(libc::EINVAL) => Err(PlatformError::NotMounted),
                err => Err(err),
            };
        }
        Ok(())
    }
}

impl ControlDevice for LinuxPlatform {
    fn read_vbattcrit(&mut self) -> Result<u32, PlatformError> {
        self.control.read_vbattcrit()
    }

    fn read_power_on_reason(&mut self) -> Result<u8, PlatformError> {
        self.control.read_power_on_reason()
    }

    fn write_power_on_reason(&mut self, reason: u8) -> Result<(), PlatformError> {
        self.control.write_power_on_reason(reason)
    }

    fn read_fw_revision(&mut self) -> Result<[u8; FW_REVISION_LEN], PlatformError> {
        self.control.read_fw_revision()
    }
}

impl BootImageWriter for LinuxPlatform {
    fn write_boot_image(&mut self, image: &[u8], slot: BootSlot) -> Result<(), PlatformError> {
        let staging = self.tools.stitch_staging.clone();
        self.write_file(&staging, image)?;
        let command = format!("{} {} {staging}", self.tools.stitch, slot.index());
        let result = self.run_tool(&command);
        let _ = self.remove_file(&staging);
        result
    }

    fn restore_payload_entry(&mut self) -> Result<(), PlatformError> {
        let command = self.tools.restore_payload.clone();
        self.run_tool(&command)
    }
}

impl PropertyStore for LinuxPlatform {
    fn set_property(&mut self, key: &str, value: &str) -> Result<(), PlatformError> {
        self.run_tool(&format!("setprop {key} {value}"))
    }
}

impl PowerControl for LinuxPlatform {
    fn power_off(&mut self) {
        self.reboot.power_off();
    }

    fn restart(&mut self, mode: RestartMode) {
        self.reboot.restart(mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn platform(tools: Tools) -> LinuxPlatform {
        LinuxPlatform::new(
            IpcControl::new(PathBuf::from("/nonexistent/mid_ipc")),
            Reboot::new(PathBuf::from("/nonexistent/force_shutdown")),
            tools,
        )
    }

    fn path(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn shell_reports_exit_codes() {
        let mut platform = platform(Tools::default());

        assert_eq!(platform.run("true").expect("spawn"), 0);
        assert_eq!(platform.run("exit 3").expect("spawn"), 3);
    }

    #[test]
    fn streaming_forwards_stdout_and_stderr_lines() {
        let mut platform = platform(Tools::default());
        let mut lines = Vec::new();

        let code = platform
            .run_streaming("echo one; echo two >&2; exit 1", &mut |line| {
                lines.push(line.to_string());
            })
            .expect("spawn");

        assert_eq!(code, 1);
        assert_eq!(lines, ["one", "two"]);
    }

    #[test]
    fn streaming_redirect_survives_trailing_comment() {
        let mut platform = platform(Tools::default());
        let mut lines = Vec::new();

        let code = platform
            .run_streaming("echo err >&2 # noisy tool", &mut |line| {
                lines.push(line.to_string());
            })
            .expect("spawn");

        assert_eq!(code, 0);
        assert_eq!(lines, ["err"]);
    }

    #[test]
    fn filesystem_port_maps_std_errors() {
        let dir = tempdir().expect("tempdir");
        let mut platform = platform(Tools::default());
        let file = path(dir.path(), "payload.bin");
        let nested = path(dir.path(), "recovery");

        platform.write_file(&file, b"abc").expect("write");
        assert_eq!(platform.read_file(&file).expect("read"), b"abc");
        assert_eq!(platform.file_len(&file).expect("len"), 3);
        assert!(platform.exists(&file));

        platform.create_dir(&nested).expect("mkdir");
        assert_eq!(platform.create_dir(&nested), Err(PlatformError::AlreadyExists));

        platform.remove_file(&file).expect("remove");
        assert_eq!(platform.remove_file(&file), Err(PlatformError::NotFound));
        assert_eq!(platform.read_file(&file), Err(PlatformError::NotFound));
    }

    #[test]
    fn stitch_tool_receives_slot_and_staged_image() {
        let dir = tempdir().expect("tempdir");
        let record = path(dir.path(), "stitch.log");
        let mut platform = platform(Tools {
            stitch: format!("echo >{record}"),
            restore_payload: "false".to_string(),
            stitch_staging: path(dir.path(), "stitched.img"),
        });

        platform
            .write_boot_image(b"ANDROID!", BootSlot::Recovery)
            .expect("stitch");

        let logged = fs::read_to_string(&record).expect("tool ran");
        assert!(logged.starts_with("1 "), "slot index first: {logged}");
        assert!(!dir.path().join("stitched.img").exists(), "staging removed");
        assert_eq!(
            platform.restore_payload_entry(),
            Err(PlatformError::Os(libc::EIO))
        );
    }
}
