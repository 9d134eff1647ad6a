//! Mount, unmount and format primitives over the partition table.

use alloc::format;
use alloc::string::String;
use core::fmt;

use log::{debug, info, warn};

use super::{FsType, MOUNT_ROOT, PartitionEntry, PartitionError, PartitionTable};
use crate::platform::{Filesystem, Mounter, PlatformError, ProcessRunner, tolerate_existing};

/// Ports needed to operate on volumes.
pub trait VolumePorts: Mounter + Filesystem + ProcessRunner {}

impl<T: Mounter + Filesystem + ProcessRunner + ?Sized> VolumePorts for T {}

/// Errors raised while operating on a partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VolumeError {
    /// The partition name did not resolve.
    Partition(PartitionError),
    /// The mount point could not be created.
    MountPoint(PlatformError),
    /// The mount primitive failed.
    Mount(PlatformError),
    /// The unmount primitive failed for a reason other than "not mounted".
    Umount(PlatformError),
    /// An external command exited with a non-zero status.
    Command(i32),
    /// An external command could not be started.
    Spawn(PlatformError),
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeError::Partition(err) => err.fmt(f),
            VolumeError::MountPoint(err) => write!(f, "unable to create mount point: {err}"),
            VolumeError::Mount(err) => write!(f, "unable to mount partition: {err}"),
            VolumeError::Umount(err) => write!(f, "unable to unmount partition: {err}"),
            VolumeError::Command(code) => write!(f, "command exited with status {code}"),
            VolumeError::Spawn(err) => write!(f, "unable to run command: {err}"),
        }
    }
}

impl core::error::Error for VolumeError {}

impl From<PartitionError> for VolumeError {
    fn from(value: PartitionError) -> Self {
        VolumeError::Partition(value)
    }
}

/// Runs `command` and maps a non-zero exit status to [`VolumeError::Command`].
pub fn run_checked<P: ProcessRunner + ?Sized>(
    ports: &mut P,
    command: &str,
) -> Result<(), VolumeError> {
    debug!("run: {command}");
    match ports.run(command) {
        Ok(0) => Ok(()),
        Ok(code) => Err(VolumeError::Command(code)),
        Err(err) => Err(VolumeError::Spawn(err)),
    }
}

/// Mounts `entry` on its mount point using the active boot device.
///
/// NFS volumes go through `mount -t nfs` since the in-process primitive
/// cannot build the network mount options.
pub fn mount<P: VolumePorts + ?Sized>(
    table: &PartitionTable,
    entry: &PartitionEntry,
    ports: &mut P,
) -> Result<(), VolumeError> {
    let target = entry.mount_point();
    tolerate_existing(ports.create_dir(&target)).map_err(VolumeError::MountPoint)?;

    let device = table.device_path(entry);
    let fs_type = table.fs_type(entry);
    info!("mount {device} on {target} ({fs_type})");

    if fs_type == FsType::Nfs {
        return run_checked(ports, &format!("mount -t nfs {device} {target}"));
    }
    ports
        .mount(&device, &target, fs_type.as_str())
        .map_err(VolumeError::Mount)
}

/// Unmounts `entry`, treating "not mounted" and "no such mount point" as
/// success.
pub fn umount<P: Mounter + ?Sized>(entry: &PartitionEntry, ports: &mut P) -> Result<(), VolumeError> {
    let target = entry.mount_point();
    match ports.umount(&target) {
        Ok(()) | Err(PlatformError::NotMounted | PlatformError::NotFound) => Ok(()),
        Err(err) => {
            warn!("umount of {target} failed: {err}");
            Err(VolumeError::Umount(err))
        }
    }
}

/// Unmounts every table partition, returning the first failure after
/// attempting all of them.
pub fn umount_all<P: Mounter + ?Sized>(
    table: &PartitionTable,
    ports: &mut P,
) -> Result<(), VolumeError> {
    let mut first_error = None;
    for entry in table.entries() {
        if let Err(err) = umount(entry, ports) {
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Command line that formats `entry` on the active boot device.
#[must_use]
pub fn format_command(table: &PartitionTable, entry: &PartitionEntry) -> String {
    let device = table.device_path(entry);
    match table.fs_type(entry) {
        fs @ (FsType::Ext3 | FsType::Ext4) => format!("mkfs.{fs} -L {} {device}", entry.name),
        FsType::Nfs => {
            format!("mount -t nfs {device} {MOUNT_ROOT} && rm -fr {MOUNT_ROOT}/* && umount {MOUNT_ROOT}")
        }
        fs @ FsType::Vfat => format!("mkfs.{fs} -i {} {device}", entry.name),
    }
}

/// Unmounts and reformats `entry`.
///
/// On the network class there is nothing to format, so the export is mounted
/// and emptied instead.
pub fn format<P: VolumePorts + ?Sized>(
    table: &PartitionTable,
    entry: &PartitionEntry,
    ports: &mut P,
) -> Result<(), VolumeError> {
    umount(entry, ports)?;
    let command = format_command(table, entry);
    info!("format {}: {command}", entry.name);
    run_checked(ports, &command)
}

/// Resolves `name` and formats it.
pub fn erase<P: VolumePorts + ?Sized>(
    table: &PartitionTable,
    name: &str,
    ports: &mut P,
) -> Result<(), VolumeError> {
    let entry = *table.find(name)?;
    format(table, &entry, ports)
}

/// Resolves `name` and mounts it.
pub fn mount_by_name<P: VolumePorts + ?Sized>(
    table: &PartitionTable,
    name: &str,
    ports: &mut P,
) -> Result<PartitionEntry, VolumeError> {
    let entry = *table.find(name)?;
    mount(table, &entry, ports)?;
    Ok(entry)
}

/// Resolves `name` and unmounts it.
pub fn umount_by_name<P: Mounter + ?Sized>(
    table: &PartitionTable,
    name: &str,
    ports: &mut P,
) -> Result<(), VolumeError> {
    let entry = table.find(name)?;
    umount(entry, ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::BootDevice;
    use alloc::collections::BTreeSet;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    #[derive(Default)]
    struct FakeVolumes {
        dirs: BTreeSet<String>,
        mounted: BTreeSet<String>,
        mounts: Vec<(String, String, String)>,
        commands: Vec<String>,
        exit_code: i32,
        umount_error: Option<PlatformError>,
    }

    impl Mounter for FakeVolumes {
        fn mount(&mut self, device: &str, target: &str, fs_type: &str) -> Result<(), PlatformError> {
            if !self.dirs.contains(target) {
                return Err(PlatformError::NotFound);
            }
            self.mounts
                .push((device.to_string(), target.to_string(), fs_type.to_string()));
            self.mounted.insert(target.to_string());
            Ok(())
        }

        fn umount(&mut self, target: &str) -> Result<(), PlatformError> {
            if let Some(err) = self.umount_error {
                return Err(err);
            }
            if self.mounted.remove(target) {
                Ok(())
            } else {
                Err(PlatformError::NotMounted)
            }
        }
    }

    impl Filesystem for FakeVolumes {
        fn write_file(&mut self, _: &str, _: &[u8]) -> Result<(), PlatformError> {
            Ok(())
        }

        fn read_file(&mut self, _: &str) -> Result<Vec<u8>, PlatformError> {
            Err(PlatformError::NotFound)
        }

        fn exists(&self, path: &str) -> bool {
            self.dirs.contains(path)
        }

        fn remove_file(&mut self, _: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        fn create_dir(&mut self, path: &str) -> Result<(), PlatformError> {
            if self.dirs.insert(path.to_string()) {
                Ok(())
            } else {
                Err(PlatformError::AlreadyExists)
            }
        }

        fn file_len(&self, _: &str) -> Result<u64, PlatformError> {
            Err(PlatformError::NotFound)
        }
    }

    impl ProcessRunner for FakeVolumes {
        fn run(&mut self, command: &str) -> Result<i32, PlatformError> {
            self.commands.push(command.to_string());
            Ok(self.exit_code)
        }
    }

    #[test]
    fn mount_creates_mount_point_once() {
        let table = PartitionTable::default();
        let mut ports = FakeVolumes::default();

        mount_by_name(&table, "cache", &mut ports).expect("first mount");
        umount_by_name(&table, "cache", &mut ports).expect("umount");
        mount_by_name(&table, "cache", &mut ports).expect("mount with existing dir");

        assert_eq!(ports.mounts.len(), 2);
        assert_eq!(
            ports.mounts[0],
            (
                "/dev/mmcblk0p7".to_string(),
                "/mnt/cache".to_string(),
                "ext4".to_string()
            )
        );
    }

    #[test]
    fn nfs_mount_uses_shell() {
        let table = PartitionTable::with_default_layout(BootDevice::Nfs);
        let mut ports = FakeVolumes::default();

        mount_by_name(&table, "system", &mut ports).expect("nfs mount");

        assert!(ports.mounts.is_empty());
        assert_eq!(
            ports.commands,
            ["mount -t nfs -o nolock 50.0.0.1:/android/nfs6 /mnt/system"]
        );
    }

    #[test]
    fn umount_tolerates_not_mounted() {
        let table = PartitionTable::default();
        let mut ports = FakeVolumes::default();
        umount_by_name(&table, "data", &mut ports).expect("not mounted is fine");
        umount_all(&table, &mut ports).expect("nothing mounted");
    }

    #[test]
    fn umount_reports_busy_volumes() {
        let table = PartitionTable::default();
        let mut ports = FakeVolumes {
            umount_error: Some(PlatformError::Os(16)),
            ..FakeVolumes::default()
        };
        assert_eq!(
            umount_all(&table, &mut ports),
            Err(VolumeError::Umount(PlatformError::Os(16)))
        );
    }

    #[test]
    fn format_commands_per_filesystem() {
        let table = PartitionTable::default();
        let data = *table.find("data").expect("data");
        let sdcard = *table.find("sdcard").expect("sdcard");

        assert_eq!(format_command(&table, &data), "mkfs.ext4 -L data /dev/mmcblk0p2");
        assert_eq!(format_command(&table, &sdcard), "mkfs.vfat -i sdcard /dev/mmcblk0p3");

        let nfs = PartitionTable::with_default_layout(BootDevice::Nfs);
        assert_eq!(
            format_command(&nfs, &data),
            "mount -t nfs -o nolock 50.0.0.1:/android/nfs2 /mnt && rm -fr /mnt/* && umount /mnt"
        );
    }

    #[test]
    fn erase_unmounts_before_formatting() {
        let table = PartitionTable::default();
        let mut ports = FakeVolumes::default();
        mount_by_name(&table, "system", &mut ports).expect("mount");

        erase(&table, "system", &mut ports).expect("erase");

        assert!(ports.mounted.is_empty());
        assert_eq!(ports.commands, ["mkfs.ext4 -L system /dev/mmcblk0p6"]);
    }

    #[test]
    fn erase_reports_failing_mkfs() {
        let table = PartitionTable::default();
        let mut ports = FakeVolumes {
            exit_code: 1,
            ..FakeVolumes::default()
        };
        assert_eq!(
            erase(&table, "cache", &mut ports),
            Err(VolumeError::Command(1))
        );
        assert_eq!(
            erase(&table, "bogus", &mut ports),
            Err(VolumeError::Partition(PartitionError::UnknownPartition))
        );
    }
}
