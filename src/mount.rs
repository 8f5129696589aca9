//! Exposing a snapshot through a virtual device name.

use std::path::Path;

use crate::error::{MountDirection, Result, ShadowError};
use crate::output::{OutputWriter, Threshold};

/// Root namespace prefix of raw device object paths.
pub const RAW_ROOT_PREFIX: &str = r"\\?\GLOBALROOT";

/// OS primitives for volume lookup and device mappings.
pub trait DeviceMapper {
    /// Mount point of the volume containing `path`, with a trailing separator (e.g. `D:\`).
    fn volume_path_name(&self, path: &Path) -> Result<String>;
    /// Maps `device` onto the raw target path. Errors carry the native code.
    fn define(&self, device: &str, target: &str) -> std::result::Result<(), u32>;
    fn remove(&self, device: &str) -> std::result::Result<(), u32>;
}

/// Path inside the snapshot that corresponds to `source`.
pub fn compute_source_path(snapshot_device_object: &str, source: &str, mount_point: &str) -> String {
    let subdirectory: String = source
        .chars()
        .skip(mount_point.chars().count())
        .map(|c| if c == '/' { '\\' } else { c })
        .collect();
    combine_path(snapshot_device_object, &subdirectory)
}

fn combine_path(base: &str, tail: &str) -> String {
    let base = base.trim_end_matches('\\');
    let tail = tail.trim_start_matches('\\');
    if tail.is_empty() {
        base.to_string()
    } else {
        format!("{}\\{}", base, tail)
    }
}

/// Drops the raw root-namespace prefix, which the mapping primitive does not accept.
pub fn strip_raw_root(path: &str) -> &str {
    path.strip_prefix(RAW_ROOT_PREFIX).unwrap_or(path)
}

pub fn mount(mapper: &dyn DeviceMapper, device: &str, raw_path: &str) -> Result<()> {
    mapper
        .define(device, strip_raw_root(raw_path))
        .map_err(|code| ShadowError::DeviceMount {
            direction: MountDirection::Mount,
            device: device.to_string(),
            code,
        })
}

/// Removes the mapping. Failures are reported as a warning and swallowed.
pub fn unmount(mapper: &dyn DeviceMapper, device: &str, out: &OutputWriter) -> bool {
    match mapper.remove(device) {
        Ok(()) => true,
        Err(code) => {
            let err = ShadowError::DeviceMount {
                direction: MountDirection::Unmount,
                device: device.to_string(),
                code,
            };
            out.write_line(err.to_string(), Threshold::UnlessSilent);
            false
        }
    }
}

#[cfg(windows)]
pub use self::windows::DosDeviceMapper;

#[cfg(windows)]
mod windows {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;

    use winapi::shared::minwindef::MAX_PATH;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{DefineDosDeviceW, GetVolumePathNameW};
    use winapi::um::winbase::{DDD_RAW_TARGET_PATH, DDD_REMOVE_DEFINITION};

    use super::DeviceMapper;
    use crate::error::{Result, ShadowError, hresult_from_win32};

    fn wide(s: &OsStr) -> Vec<u16> {
        s.encode_wide().chain(Some(0)).collect()
    }

    /// DOS device mappings via `DefineDosDeviceW`.
    pub struct DosDeviceMapper;

    impl DeviceMapper for DosDeviceMapper {
        fn volume_path_name(&self, path: &Path) -> Result<String> {
            let source = wide(path.as_os_str());
            let mut buf = [0u16; MAX_PATH];
            let ok = unsafe { GetVolumePathNameW(source.as_ptr(), buf.as_mut_ptr(), MAX_PATH as u32) };
            if ok == 0 {
                let code = unsafe { GetLastError() };
                return Err(ShadowError::platform("GetVolumePathName", hresult_from_win32(code)));
            }
            let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
            Ok(String::from_utf16_lossy(&buf[..len]))
        }

        fn define(&self, device: &str, target: &str) -> std::result::Result<(), u32> {
            let device = wide(OsStr::new(device));
            let target = wide(OsStr::new(target));
            let ok = unsafe { DefineDosDeviceW(DDD_RAW_TARGET_PATH, device.as_ptr(), target.as_ptr()) };
            if ok == 0 { Err(unsafe { GetLastError() }) } else { Ok(()) }
        }

        fn remove(&self, device: &str) -> std::result::Result<(), u32> {
            let device = wide(OsStr::new(device));
            let ok = unsafe { DefineDosDeviceW(DDD_REMOVE_DEFINITION, device.as_ptr(), ptr::null()) };
            if ok == 0 { Err(unsafe { GetLastError() }) } else { Ok(()) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_path_from_drive_root() {
        let raw = compute_source_path(r"\\?\GLOBALROOT\Device\Snap1", r"D:\Data\Proj", r"D:\");
        assert_eq!(raw, r"\\?\GLOBALROOT\Device\Snap1\Data\Proj");
        assert_eq!(strip_raw_root(&raw), r"\Device\Snap1\Data\Proj");
    }

    #[test]
    fn test_forward_slashes_become_separators() {
        let raw = compute_source_path(r"\\?\GLOBALROOT\Device\Snap1", "D:/Data/Proj", r"D:\");
        assert_eq!(strip_raw_root(&raw), r"\Device\Snap1\Data\Proj");
    }

    #[test]
    fn test_source_path_is_volume_root() {
        let raw = compute_source_path(r"\\?\GLOBALROOT\Device\Snap1", r"D:\", r"D:\");
        assert_eq!(raw, r"\\?\GLOBALROOT\Device\Snap1");
    }

    #[test]
    fn test_source_path_under_mounted_folder() {
        let raw = compute_source_path(r"\Device\Snap7", r"C:\Mounts\Vol\logs", r"C:\Mounts\Vol\");
        assert_eq!(raw, r"\Device\Snap7\logs");
        // no prefix to strip
        assert_eq!(strip_raw_root(&raw), raw);
    }
}
