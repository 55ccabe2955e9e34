// file: src/device/mod.rs
// version: 1.2.0
// guid: e5f60718-293a-4b5c-6d7e-8f9012345678

//! Removable storage device enumeration and host-side device control.
//!
//! Enumeration is fresh on every call; results are never cached across
//! insert/remove events, so callers re-enumerate whenever they need the
//! current picture.

use crate::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tokio::process::Command;
use tracing::{debug, warn};

/// Upper bound on what we are willing to treat as removable flash media.
/// Anything larger is almost certainly an external data drive, not a card
/// destined for a single-board computer.
const MAX_FLASH_TARGET_BYTES: u64 = 2 * 1024 * 1024 * 1024 * 1024;

/// A candidate removable storage device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDevice {
    /// Raw device path suitable for unbuffered writes.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub removable: bool,
}

/// List removable storage devices visible to the host.
///
/// Internal system disks are filtered out. An empty list is a normal result,
/// not an error. Cheap enough for the UI to poll on demand.
pub fn list_devices() -> Result<Vec<StorageDevice>> {
    let disks = Disks::new_with_refreshed_list();
    let mut devices = Vec::new();

    for disk in disks.list() {
        if !disk.is_removable() {
            continue;
        }

        let mount = disk.mount_point().to_string_lossy().to_string();
        if !is_candidate_mount(&mount) {
            continue;
        }

        let name = disk.name().to_string_lossy().to_string();
        devices.push(StorageDevice {
            path: raw_device_path(&mount),
            name: if name.is_empty() {
                "Removable media".to_string()
            } else {
                name
            },
            size: disk.total_space(),
            removable: true,
        });
    }

    debug!("Enumerated {} removable device(s)", devices.len());
    Ok(devices)
}

/// Final guard before any destructive operation on a device path.
pub fn verify_safe_to_flash(device_path: &str, size: u64) -> Result<()> {
    if !looks_like_raw_device(device_path) {
        return Err(ProvisionError::Validation(format!(
            "'{}' does not look like a raw removable device path",
            device_path
        )));
    }

    if size > MAX_FLASH_TARGET_BYTES {
        return Err(ProvisionError::Validation(format!(
            "device is {} bytes, larger than the removable-media ceiling",
            size
        )));
    }

    Ok(())
}

/// Mount-point heuristic: only paths where the platform mounts external
/// media are considered.
fn is_candidate_mount(mount_path: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        mount_path.starts_with("/Volumes/") && !mount_path.contains("Macintosh")
    }

    #[cfg(target_os = "linux")]
    {
        mount_path.starts_with("/media/") || mount_path.starts_with("/run/media/")
    }

    #[cfg(target_os = "windows")]
    {
        mount_path.len() == 3 && mount_path.ends_with(":\\")
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = mount_path;
        false
    }
}

/// Whole-disk raw paths only; partition paths or mount points are rejected.
fn looks_like_raw_device(path: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        path.starts_with("/dev/rdisk") || path.starts_with("/dev/disk")
    }

    #[cfg(target_os = "linux")]
    {
        (path.starts_with("/dev/sd") && !path.ends_with(|c: char| c.is_ascii_digit()))
            || (path.starts_with("/dev/mmcblk") && !path.contains('p'))
    }

    #[cfg(target_os = "windows")]
    {
        path.starts_with("\\\\.\\")
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = path;
        false
    }
}

/// Map a mount point to the underlying raw device path.
fn raw_device_path(mount_path: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        use std::process::Command;

        // diskutil reports the DeviceIdentifier for a mounted volume;
        // prefix with /dev/r for the unbuffered device node.
        let output = Command::new("diskutil")
            .args(["info", "-plist", mount_path])
            .output();

        if let Ok(output) = output {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(device) = parse_plist_string(&stdout, "DeviceIdentifier") {
                // disk4s1 -> disk4
                let whole = device
                    .strip_prefix("disk")
                    .map(|rest| {
                        let digits: String =
                            rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                        format!("disk{}", digits)
                    })
                    .unwrap_or(device);
                return format!("/dev/r{}", whole);
            }
        }
        mount_path.to_string()
    }

    #[cfg(target_os = "linux")]
    {
        use std::process::Command;

        let output = Command::new("findmnt")
            .args(["-n", "-o", "SOURCE", mount_path])
            .output();

        if let Ok(output) = output {
            let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !device.is_empty() {
                return strip_partition_suffix(&device);
            }
        }
        mount_path.to_string()
    }

    #[cfg(target_os = "windows")]
    {
        let letter = mount_path.chars().next().unwrap_or('D');
        format!("\\\\.\\{}:", letter)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        mount_path.to_string()
    }
}

#[cfg(target_os = "macos")]
fn parse_plist_string(plist: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", key);
    let rest = &plist[plist.find(&marker)? + marker.len()..];
    let start = rest.find("<string>")? + "<string>".len();
    let end = rest[start..].find("</string>")? + start;
    Some(rest[start..end].to_string())
}

/// /dev/sda1 -> /dev/sda, /dev/mmcblk0p2 -> /dev/mmcblk0
#[allow(dead_code)]
fn strip_partition_suffix(device: &str) -> String {
    if let Some(idx) = device.find("mmcblk") {
        if let Some(p) = device[idx..].find('p') {
            return device[..idx + p].to_string();
        }
        return device.to_string();
    }
    device.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

/// Release the device from the host automounter so raw writes are safe.
pub async fn unmount_device(device_path: &str) -> Result<()> {
    debug!("Unmounting {}", device_path);

    #[cfg(target_os = "macos")]
    let output = Command::new("diskutil")
        .args(["unmountDisk", device_path])
        .output()
        .await?;

    #[cfg(target_os = "linux")]
    let output = Command::new("umount").arg(device_path).output().await?;

    #[cfg(target_os = "windows")]
    let output = Command::new("mountvol")
        .args([device_path, "/D"])
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // An already-unmounted disk is fine; a held disk is not.
        if stderr.contains("busy") || stderr.contains("in use") {
            return Err(ProvisionError::DeviceBusy(format!(
                "{}: {}",
                device_path,
                stderr.trim()
            )));
        }
        warn!("unmount reported: {}", stderr.trim());
    }

    Ok(())
}

/// Signal safe removal to the host OS.
pub async fn eject_device(device_path: &str) -> Result<()> {
    debug!("Ejecting {}", device_path);

    #[cfg(target_os = "macos")]
    let output = Command::new("diskutil")
        .args(["eject", device_path])
        .output()
        .await?;

    #[cfg(target_os = "linux")]
    let output = Command::new("eject").arg(device_path).output().await?;

    #[cfg(target_os = "windows")]
    let output = Command::new("powershell")
        .args([
            "-Command",
            &format!(
                "(New-Object -comObject Shell.Application).Namespace(17).ParseName('{}').InvokeVerb('Eject')",
                device_path
            ),
        ])
        .output()
        .await?;

    if !output.status.success() {
        return Err(ProvisionError::DeviceBusy(format!(
            "eject failed for {}: {}",
            device_path,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}
