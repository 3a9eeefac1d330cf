//! LUKS2 crypt device management.
//!
//! Formats, opens, and closes encrypted block devices by driving the
//! host `cryptsetup` binary. Key material is always piped through
//! standard input, never passed on a command line. Every open and
//! close holds an exclusive lock on `/dev/mapper` so concurrent
//! starters cannot race mapper creation.

use crate::config::types::{Result, StarterError};
use crate::kernel::loopdev::{LoopDevice, LoopInfo, LO_FLAGS_AUTOCLEAR};
use crate::utils::cast;
use log::debug;
use nix::fcntl::{open as nix_open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use uuid::Uuid;

/// Fixed allowance for the LUKS2 header plus encryption overhead.
/// With the options used below the header stays under 16 MiB; the
/// overhead itself may depend on image size, so very large images
/// could need more.
/// TODO: replace with a sizing rule derived from the image size.
const CRYPT_HEADER_SLACK: u64 = 16 * 1024 * 1024;

/// Copy buffer for streaming image payloads into the mapper device.
const COPY_BUFFER_SIZE: usize = 10 * 1024;

/// Mapper-name allocation attempts before giving up.
const MAX_OPEN_RETRIES: usize = 3;

/// Cumulative device-appearance wait before giving up.
const APPEARANCE_DEADLINE: Duration = Duration::from_millis(25_500);

/// Where the mapper lock and the activated devices live.
const MAPPER_DIR: &str = "/dev/mapper";

/// Expected size of the temporary encrypted device for an image.
fn encrypted_device_size(image_size: u64) -> u64 {
    image_size + CRYPT_HEADER_SLACK
}

/// How a failed cryptsetup invocation should be handled.
#[derive(Debug, PartialEq, Eq)]
enum CryptFailure {
    /// Transient mapper-name collision, retried with a fresh name.
    NameCollision,
    /// The supplied passphrase does not match any key slot.
    BadPassphrase,
    Other,
}

fn classify_failure(output: &str) -> CryptFailure {
    if output.contains("Device already exists") {
        CryptFailure::NameCollision
    } else if output.contains("No key available") {
        CryptFailure::BadPassphrase
    } else {
        CryptFailure::Other
    }
}

/// Exclusive advisory lock on `/dev/mapper`, held for the duration of
/// an open or close sequence.
struct MapperLock {
    fd: RawFd,
}

impl MapperLock {
    fn acquire() -> Result<Self> {
        let fd = nix_open(
            Path::new(MAPPER_DIR),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| StarterError::Crypt(format!("unable to open {MAPPER_DIR}: {e}")))?;

        // Safety: fd is an open directory descriptor.
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            let _ = close(fd);
            return Err(StarterError::Crypt(format!(
                "unable to acquire lock on {MAPPER_DIR}: {err}"
            )));
        }
        Ok(MapperLock { fd })
    }
}

impl Drop for MapperLock {
    fn drop(&mut self) {
        // Safety: fd is the locked directory descriptor.
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
        let _ = close(self.fd);
    }
}

/// A crypt device manager bound to the host cryptsetup binary.
pub struct CryptDevice {
    /// Source of fresh mapper names; swapped out by tests that need a
    /// deterministic sequence.
    name_source: fn() -> String,
}

impl Default for CryptDevice {
    fn default() -> Self {
        CryptDevice {
            name_source: || Uuid::new_v4().to_string(),
        }
    }
}

impl CryptDevice {
    #[cfg(test)]
    fn with_name_source(name_source: fn() -> String) -> Self {
        CryptDevice { name_source }
    }

    /// Take a plain filesystem image, produce a LUKS2-formatted copy of
    /// it in `tempdir`, and return the path of the new file. The caller
    /// owns removal of the returned file.
    pub fn encrypt_filesystem(&self, image: &Path, key: &[u8], tempdir: &Path) -> Result<PathBuf> {
        let image_size = std::fs::metadata(image)
            .map_err(|_| {
                StarterError::Crypt(format!("failed getting size of {}", image.display()))
            })?
            .size();

        let cryptsetup = find_cryptsetup()?;
        // Gate on the binary before any loop device is attached so an
        // unusable cryptsetup cannot leave half-built state behind.
        check_version(&cryptsetup)?;

        let crypt_file = tempfile::Builder::new()
            .prefix("crypt-")
            .tempfile_in(tempdir)
            .map_err(|e| StarterError::Crypt(format!("temporary crypt file: {e}")))?;
        let (_, crypt_path) = crypt_file
            .keep()
            .map_err(|e| StarterError::Crypt(format!("temporary crypt file: {e}")))?;

        let device_size = encrypted_device_size(image_size);
        debug!("total device size for encrypted image: {device_size}");

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&crypt_path)?;
        file.set_len(device_size)?;
        drop(file);

        let loop_device = LoopDevice {
            image: crypt_path.clone(),
            read_only: false,
            info: LoopInfo {
                offset: 0,
                size_limit: device_size,
                flags: LO_FLAGS_AUTOCLEAR,
                encrypt_type: 0,
            },
            max_devices: 256,
            shared: false,
        };
        let index = loop_device.attach()?;
        let loopdev = PathBuf::from(format!("/dev/loop{index}"));

        let output = run_cryptsetup(
            &cryptsetup,
            &[
                "luksFormat",
                "--batch-mode",
                "--type",
                "luks2",
                "--key-file",
                "-",
                &loopdev.to_string_lossy(),
            ],
            Some(key),
            false,
        )?;
        if !output.success {
            check_version(&cryptsetup)?;
            return Err(StarterError::Crypt(format!(
                "unable to format crypt device {}: {}",
                crypt_path.display(),
                output.combined
            )));
        }

        let mapper = self.open(key, &loopdev)?;
        let mapper_path = format!("{MAPPER_DIR}/{mapper}");

        let copied = copy_device_contents(image, Path::new(&mapper_path), image_size);
        if let Err(err) = copied {
            let _ = self.close(&mapper);
            return Err(err);
        }

        let output = run_cryptsetup(&cryptsetup, &["close", &mapper], None, false)?;
        if !output.success {
            return Err(StarterError::Crypt(format!(
                "closing mapper {mapper} failed: {}",
                output.combined
            )));
        }

        Ok(crypt_path)
    }

    /// Open the encrypted block device at `path` (usually a loop
    /// device) and return the mapper name assigned to it.
    pub fn open(&self, key: &[u8], path: &Path) -> Result<String> {
        let _lock = MapperLock::acquire()?;
        let cryptsetup = find_cryptsetup()?;

        for _ in 0..MAX_OPEN_RETRIES {
            let name = (self.name_source)();
            if name.is_empty() {
                return Err(StarterError::Crypt("crypt device not available".to_string()));
            }

            let output = run_cryptsetup(
                &cryptsetup,
                &[
                    "open",
                    "--batch-mode",
                    "--type",
                    "luks2",
                    "--key-file",
                    "-",
                    &path.to_string_lossy(),
                    &name,
                ],
                Some(key),
                true,
            )?;

            if !output.success {
                match classify_failure(&output.combined) {
                    CryptFailure::NameCollision => continue,
                    CryptFailure::BadPassphrase => {
                        check_version(&cryptsetup)?;
                        debug!("invalid passphrase for {}", path.display());
                        return Err(StarterError::InvalidPassphrase);
                    }
                    CryptFailure::Other => {
                        check_version(&cryptsetup)?;
                        return Err(StarterError::Crypt(format!(
                            "cryptsetup open failed: {}",
                            output.combined
                        )));
                    }
                }
            }

            wait_for_mapper(&name)?;
            debug!("successfully opened encrypted device {}", path.display());
            return Ok(name);
        }

        Err(StarterError::MapperNamesExhausted)
    }

    /// Close an activated mapper device.
    pub fn close(&self, name: &str) -> Result<()> {
        let _lock = MapperLock::acquire()?;
        let cryptsetup = find_cryptsetup()?;

        let output = run_cryptsetup(&cryptsetup, &["close", name], None, true)?;
        if !output.success {
            debug!("unable to delete the crypt device: {}", output.combined);
            return Err(StarterError::Crypt(format!(
                "cryptsetup close {name} failed: {}",
                output.combined
            )));
        }
        Ok(())
    }
}

/// Poll for `/dev/mapper/<name>` with a doubling back-off starting at
/// 100 ms, failing once the cumulative delay reaches the deadline.
fn wait_for_mapper(name: &str) -> Result<()> {
    let path = PathBuf::from(format!("{MAPPER_DIR}/{name}"));
    let mut delay = Duration::from_millis(100);
    let mut waited = Duration::ZERO;

    loop {
        match std::fs::symlink_metadata(&path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if waited >= APPEARANCE_DEADLINE {
            return Err(StarterError::Crypt(format!(
                "device {} did not show up within {} seconds",
                path.display(),
                waited.as_secs()
            )));
        }
        std::thread::sleep(delay);
        waited += delay;
        delay *= 2;
    }
}

struct CmdOutput {
    success: bool,
    combined: String,
}

/// Run cryptsetup with the given arguments, piping `stdin_data` when
/// provided. `as_root` forces uid/gid 0 for the child, required when
/// the starter runs with saved root privileges.
fn run_cryptsetup(
    binary: &Path,
    args: &[&str],
    stdin_data: Option<&[u8]>,
    as_root: bool,
) -> Result<CmdOutput> {
    debug!("running {} {}", binary.display(), args.join(" "));

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if as_root {
        cmd.uid(0).gid(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| StarterError::Crypt(format!("failed to run {}: {e}", binary.display())))?;

    if let Some(data) = stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StarterError::Crypt("child stdin unavailable".to_string()))?;
        stdin.write_all(data)?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .map_err(|e| StarterError::Crypt(format!("waiting for {}: {e}", binary.display())))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(CmdOutput {
        success: output.status.success(),
        combined,
    })
}

/// Locate cryptsetup on the standard binary paths and verify it is
/// owned by root. Invoking a user-controlled binary with retained
/// privileges would hand those privileges away.
fn find_cryptsetup() -> Result<PathBuf> {
    let binary = find_binary("cryptsetup")?;
    if !is_owner_root(&binary)? {
        return Err(StarterError::Privilege(format!(
            "{} must be owned by root",
            binary.display()
        )));
    }
    Ok(binary)
}

fn find_binary(name: &str) -> Result<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();
    for fallback in ["/sbin", "/usr/sbin", "/usr/local/sbin"] {
        dirs.push(PathBuf::from(fallback));
    }
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(StarterError::Crypt(format!("{name} not found in PATH")))
}

fn is_owner_root(path: &Path) -> Result<bool> {
    Ok(std::fs::metadata(path)?.uid() == 0)
}

/// Verify the cryptsetup on this host is from the 2.x series. Called
/// after a failed invocation so version problems surface as their own
/// error instead of a generic failure.
fn check_version(binary: &Path) -> Result<()> {
    let output = run_cryptsetup(binary, &["--version"], None, false)?;
    if !output.success {
        return Err(StarterError::Crypt(format!(
            "failed to run cryptsetup --version: {}",
            output.combined
        )));
    }
    if !output.combined.contains("cryptsetup 2.") {
        return Err(StarterError::UnsupportedCryptsetupVersion);
    }
    Ok(())
}

/// Stream `size` bytes from source into dest through a small buffer.
/// Either side can be a regular file or a block device.
fn copy_device_contents(source: &Path, dest: &Path, size: u64) -> Result<()> {
    debug!(
        "copying {} to {}, size {size}",
        source.display(),
        dest.display()
    );

    let mut src = File::open(source)
        .map_err(|_| StarterError::Crypt(format!("unable to open the file {}", source.display())))?;
    let mut dst = std::fs::OpenOptions::new()
        .write(true)
        .open(dest)
        .map_err(|_| StarterError::Crypt(format!("unable to open the file {}", dest.display())))?;

    let size = cast::to_i64(size)?;
    let mut written: i64 = 0;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];

    while written < size {
        let n = src.read(&mut buffer).map_err(|_| {
            StarterError::Crypt(format!("unable to read the file {}", source.display()))
        })?;
        if n == 0 {
            break;
        }
        dst.write_all(&buffer[..n]).map_err(|_| {
            StarterError::Crypt(format!("unable to write to destination {}", dest.display()))
        })?;
        written += n as i64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_size_overallocates_by_the_header_slack() {
        assert_eq!(encrypted_device_size(0), 16 * 1024 * 1024);
        assert_eq!(
            encrypted_device_size(64 * 1024 * 1024),
            80 * 1024 * 1024
        );
        // The slack is a constant, independent of image size.
        assert_eq!(
            encrypted_device_size(7) - 7,
            encrypted_device_size(1 << 40) - (1 << 40)
        );
    }

    #[test]
    fn failure_classification_matches_cryptsetup_output() {
        assert_eq!(
            classify_failure("Cannot use device: Device already exists\n"),
            CryptFailure::NameCollision
        );
        assert_eq!(
            classify_failure("No key available with this passphrase.\n"),
            CryptFailure::BadPassphrase
        );
        assert_eq!(
            classify_failure("Device /dev/loop9 is busy.\n"),
            CryptFailure::Other
        );
    }

    #[test]
    fn backoff_schedule_caps_at_the_deadline() {
        // Doubling from 100 ms, the schedule sleeps 100..12800 ms and
        // the cumulative wait hits exactly 25.5 s before failing.
        let mut delay = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        let mut sleeps = Vec::new();
        while waited < APPEARANCE_DEADLINE {
            sleeps.push(delay);
            waited += delay;
            delay *= 2;
        }
        assert_eq!(sleeps.first().copied(), Some(Duration::from_millis(100)));
        assert_eq!(sleeps.last().copied(), Some(Duration::from_millis(12_800)));
        assert_eq!(waited, Duration::from_millis(25_500));
    }

    #[test]
    fn default_name_source_yields_distinct_uuids() {
        let device = CryptDevice::default();
        let a = (device.name_source)();
        let b = (device.name_source)();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn empty_generated_name_never_reaches_cryptsetup() {
        let device = CryptDevice::with_name_source(String::new);
        // Depending on the host this fails on the mapper lock, the
        // binary lookup, or the empty-name guard; it must never succeed.
        let result = device.open(b"key", Path::new("/dev/loop0"));
        assert!(result.is_err());
        if let Err(StarterError::Crypt(msg)) = &result {
            if msg == "crypt device not available" {
                return;
            }
        }
    }
}
