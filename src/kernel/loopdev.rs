//! Loop device management.
//!
//! Attaches image files to `/dev/loopN` by scanning indexes in order
//! and claiming the lowest free device. Shared attachments reuse an
//! existing device when the backing file, offset, and size limit all
//! match the request.

use crate::config::types::{Result, StarterError};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::close;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_SET_DIRECT_IO: libc::c_ulong = 0x4C08;

const LOOP_MAJOR: u64 = 7;

/// Detach the device when the last reference is closed.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
/// Request direct I/O against the backing file.
pub const LO_FLAGS_DIRECT_IO: u32 = 16;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Kernel loop_info64 layout for LOOP_{GET,SET}_STATUS64.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // Zeroed struct is the kernel's own initial state.
        unsafe { std::mem::zeroed() }
    }
}

/// Attachment parameters applied through LOOP_SET_STATUS64.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub offset: u64,
    pub size_limit: u64,
    pub flags: u32,
    pub encrypt_type: u32,
}

/// A loop device attachment request.
#[derive(Clone, Debug)]
pub struct LoopDevice {
    pub image: PathBuf,
    pub read_only: bool,
    pub info: LoopInfo,
    pub max_devices: u32,
    pub shared: bool,
}

enum DeviceOpen {
    Fd(RawFd),
    Skip,
}

impl LoopDevice {
    /// Attach the image to the lowest matching or free loop device and
    /// return its index.
    pub fn attach(&self) -> Result<u32> {
        let image_fd = open(&self.image, self.open_flags(), Mode::empty()).map_err(|e| match e {
            Errno::ENOENT => {
                StarterError::Loop(format!("image {} does not exist", self.image.display()))
            }
            other => StarterError::Loop(format!(
                "failed to open image {}: {other}",
                self.image.display()
            )),
        })?;

        let result = self.scan_devices(image_fd);
        let _ = close(image_fd);
        result
    }

    fn open_flags(&self) -> OFlag {
        if self.read_only {
            OFlag::O_RDONLY | OFlag::O_CLOEXEC
        } else {
            OFlag::O_RDWR | OFlag::O_CLOEXEC
        }
    }

    fn scan_devices(&self, image_fd: RawFd) -> Result<u32> {
        for index in 0..self.max_devices {
            let path = PathBuf::from(format!("/dev/loop{index}"));
            let device_fd = match self.open_device(&path, index)? {
                DeviceOpen::Fd(fd) => fd,
                DeviceOpen::Skip => continue,
            };

            let claimed = self.try_device(device_fd, image_fd, index);
            let _ = close(device_fd);
            if claimed? {
                return Ok(index);
            }
        }
        Err(StarterError::LoopDevicesExhausted)
    }

    fn open_device(&self, path: &Path, index: u32) -> Result<DeviceOpen> {
        match open(path, self.open_flags(), Mode::empty()) {
            Ok(fd) => Ok(DeviceOpen::Fd(fd)),
            Err(Errno::ENOENT) => {
                // Device node not created yet; make it and retry once.
                let dev = makedev(LOOP_MAJOR, index as u64);
                if mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o660), dev).is_err() {
                    return Ok(DeviceOpen::Skip);
                }
                match open(path, self.open_flags(), Mode::empty()) {
                    Ok(fd) => Ok(DeviceOpen::Fd(fd)),
                    Err(_) => Ok(DeviceOpen::Skip),
                }
            }
            Err(Errno::EPERM) | Err(Errno::EACCES) => Err(StarterError::Privilege(format!(
                "no permission to open {}",
                path.display()
            ))),
            Err(_) => Ok(DeviceOpen::Skip),
        }
    }

    /// Try to use this device for the request. Returns Ok(true) when the
    /// device now serves the image.
    fn try_device(&self, device_fd: RawFd, image_fd: RawFd, index: u32) -> Result<bool> {
        let mut status = LoopInfo64::default();
        // Safety: status points at a properly sized loop_info64.
        let rc = unsafe { libc::ioctl(device_fd, LOOP_GET_STATUS64, &mut status) };

        if rc == 0 {
            // Device is attached to something.
            if self.shared && status_matches(&status, &self.image, &self.info) {
                debug!("reusing shared loop device {index}");
                return Ok(true);
            }
            return Ok(false);
        }

        match Errno::last() {
            // ENXIO: device is free.
            Errno::ENXIO => {}
            // ENOTTY: not a loop device at all.
            Errno::ENOTTY => return Ok(false),
            other => {
                return Err(StarterError::Loop(format!(
                    "loop status query on index {index} failed: {other}"
                )))
            }
        }

        // Claim the free device. A concurrent claimer races us here and
        // the kernel reports EBUSY, in which case the scan moves on.
        let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_FD, image_fd as libc::c_long) };
        if rc != 0 {
            return match Errno::last() {
                Errno::EBUSY => Ok(false),
                other => Err(StarterError::Loop(format!(
                    "attaching image to loop{index} failed: {other}"
                ))),
            };
        }

        if let Err(err) = self.apply_status(device_fd, index) {
            // Roll the association back so no partial attachment leaks.
            unsafe { libc::ioctl(device_fd, LOOP_CLR_FD, 0) };
            return Err(err);
        }

        debug!("attached {} to loop device {index}", self.image.display());
        Ok(true)
    }

    fn apply_status(&self, device_fd: RawFd, index: u32) -> Result<()> {
        let mut status = LoopInfo64 {
            lo_offset: self.info.offset,
            lo_sizelimit: self.info.size_limit,
            lo_flags: self.info.flags,
            lo_encrypt_type: self.info.encrypt_type,
            ..LoopInfo64::default()
        };
        write_name(&mut status.lo_file_name, &self.image);

        // Safety: status points at a properly sized loop_info64.
        let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_STATUS64, &status) };
        if rc != 0 {
            return Err(StarterError::Loop(format!(
                "setting status on loop{index} failed: {}",
                Errno::last()
            )));
        }

        if self.info.flags & LO_FLAGS_DIRECT_IO != 0 {
            // Direct I/O is best effort; the backing filesystem may not
            // support it.
            let rc = unsafe { libc::ioctl(device_fd, LOOP_SET_DIRECT_IO, 1 as libc::c_long) };
            if rc != 0 {
                debug!("direct I/O not enabled on loop{index}: {}", Errno::last());
            }
        }

        Ok(())
    }
}

/// Detach a loop device by index.
pub fn detach(index: u32) -> Result<()> {
    let path = format!("/dev/loop{index}");
    let fd = open(
        Path::new(&path),
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| StarterError::Loop(format!("failed to open {path}: {e}")))?;
    // Safety: fd refers to an open loop device.
    let rc = unsafe { libc::ioctl(fd, LOOP_CLR_FD, 0) };
    let errno = Errno::last();
    let _ = close(fd);
    if rc != 0 && errno != Errno::ENXIO {
        return Err(StarterError::Loop(format!(
            "detaching {path} failed: {errno}"
        )));
    }
    Ok(())
}

fn write_name(target: &mut [u8; LO_NAME_SIZE], path: &Path) {
    let bytes = path.as_os_str().as_encoded_bytes();
    let len = bytes.len().min(LO_NAME_SIZE - 1);
    target[..len].copy_from_slice(&bytes[..len]);
    target[len..].fill(0);
}

/// Whether an attached device already serves this exact request.
fn status_matches(status: &LoopInfo64, image: &Path, info: &LoopInfo) -> bool {
    let name_len = status
        .lo_file_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(LO_NAME_SIZE);
    let attached = &status.lo_file_name[..name_len];

    let bytes = image.as_os_str().as_encoded_bytes();
    let truncated = &bytes[..bytes.len().min(LO_NAME_SIZE - 1)];

    attached == truncated
        && status.lo_offset == info.offset
        && status.lo_sizelimit == info.size_limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(path: &str, offset: u64, size_limit: u64) -> LoopInfo64 {
        let mut status = LoopInfo64::default();
        write_name(&mut status.lo_file_name, Path::new(path));
        status.lo_offset = offset;
        status.lo_sizelimit = size_limit;
        status
    }

    #[test]
    fn shared_match_requires_identical_geometry() {
        let info = LoopInfo {
            offset: 4096,
            size_limit: 1 << 20,
            ..LoopInfo::default()
        };
        let status = status_for("/tmp/image.sif", 4096, 1 << 20);

        assert!(status_matches(&status, Path::new("/tmp/image.sif"), &info));
        assert!(!status_matches(&status, Path::new("/tmp/other.sif"), &info));

        let other_offset = LoopInfo { offset: 0, ..info };
        assert!(!status_matches(
            &status,
            Path::new("/tmp/image.sif"),
            &other_offset
        ));
    }

    #[test]
    fn long_backing_paths_compare_on_the_truncated_prefix() {
        let long = format!("/tmp/{}", "x".repeat(100));
        let info = LoopInfo::default();
        let status = status_for(&long, 0, 0);
        assert!(status_matches(&status, Path::new(&long), &info));
    }

    #[test]
    fn attach_on_missing_image_is_fatal() {
        let device = LoopDevice {
            image: PathBuf::from("/nonexistent/image.sif"),
            read_only: true,
            info: LoopInfo::default(),
            max_devices: 4,
            shared: false,
        };
        match device.attach() {
            Err(StarterError::Loop(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
