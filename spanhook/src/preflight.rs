//! Pre-flight checks for spanhook
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use std::path::Path;

/// Minimum kernel version: ring buffers appeared in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns an error when not running as root or when the kernel is too old.
pub fn run_preflight_checks(pin_path: Option<&Path>) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    raise_memlock_limit();
    if let Some(pin_path) = pin_path {
        mount_bpf_fs(pin_path);
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: spanhook requires root privileges to load eBPF programs.\n\n\
         Run with: sudo spanhook ..."
    );
}

/// `(major, minor)` of a kernel release such as `6.1.0-arch1-1`
#[must_use]
pub fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    check_kernel_release(version_str.split_whitespace().nth(2).unwrap_or("unknown"))
}

fn check_kernel_release(release: &str) -> Result<()> {
    let Some(version) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             spanhook requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// Older kernels account eBPF maps against `RLIMIT_MEMLOCK`
fn raise_memlock_limit() {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

/// Mount bpffs at `pin_path` so pinned maps can be shared.
///
/// Failures are only logged: loading without pinning still works, and
/// an already mounted filesystem reports `EBUSY`.
pub fn mount_bpf_fs(pin_path: &Path) {
    if let Err(e) = std::fs::create_dir_all(pin_path) {
        warn!("can't create pin path {}: {e}", pin_path.display());
        return;
    }
    match mount(Some(pin_path), pin_path, Some("bpf"), MsFlags::empty(), None::<&str>) {
        Ok(()) => debug!("mounted bpffs at {}", pin_path.display()),
        Err(Errno::EBUSY) => debug!("bpffs already mounted at {}", pin_path.display()),
        Err(e) => warn!("can't mount pin path {}: {e}", pin_path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.15.0-91-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("4.19"), Some((4, 19)));
        assert_eq!(parse_kernel_release("unknown"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(parse_kernel_release("5.4.0").unwrap() < MIN_KERNEL_VERSION);
        assert!(parse_kernel_release("5.10.0").unwrap() >= MIN_KERNEL_VERSION);
    }

    #[test]
    fn test_kernel_release_check() {
        assert!(check_kernel_release("6.1.0-arch1-1").is_ok());
        assert!(check_kernel_release("5.8.0").is_ok());
        assert!(check_kernel_release("unknown").is_ok());

        let err = check_kernel_release("4.19.0-25-amd64").unwrap_err();
        assert!(err.to_string().contains("Kernel version 4.19 is too old"));
    }

    #[test]
    fn test_kernel_version_check_matches_host() {
        let version = std::fs::read_to_string("/proc/version").unwrap();
        let release = version.split_whitespace().nth(2).unwrap();
        println!("Host kernel: {release}");

        match parse_kernel_release(release) {
            Some(v) if v < MIN_KERNEL_VERSION => assert!(check_kernel_version().is_err()),
            _ => assert!(check_kernel_version().is_ok()),
        }
    }
}
