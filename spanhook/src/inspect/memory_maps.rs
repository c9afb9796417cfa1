//! Shared module lookup in a process address space.
//!
//! Module hooks have to be attached to the exact file the target mapped,
//! which may live in another mount namespace. `/proc/<pid>/map_files/<range>`
//! gives a path to that file from ours.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::domain::Pid;

/// One mapping line of `/proc/<pid>/maps` backed by a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    pub start: u64,
    pub end: u64,
    pub pathname: String,
}

impl ModuleMapping {
    /// `start-end` in the lowercase hex form used by `map_files`.
    #[must_use]
    pub fn range_name(&self) -> String {
        format!("{:x}-{:x}", self.start, self.end)
    }
}

/// First file mapping whose path contains `module` (e.g. `libssl.so`).
#[must_use]
pub fn find_module_mapping(maps: &str, module: &str) -> Option<ModuleMapping> {
    maps.lines().find_map(|line| {
        // "start-end perms offset dev inode pathname"
        let mut parts = line.split_whitespace();
        let range = parts.next()?;
        let pathname = parts.nth(4)?;
        if !pathname.starts_with('/') || !pathname.contains(module) {
            return None;
        }
        let (start, end) = range.split_once('-')?;
        Some(ModuleMapping {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            pathname: pathname.to_string(),
        })
    })
}

/// Path to attach module hooks of `module` in process `pid`, `None` when
/// the process has not mapped the module.
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read.
pub fn resolve_module_path(pid: Pid, module: &str) -> Result<Option<(PathBuf, ModuleMapping)>> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path).with_context(|| format!("Failed to read {maps_path}"))?;

    Ok(find_module_mapping(&maps, module).map(|mapping| {
        let path = PathBuf::from(format!("/proc/{}/map_files/{}", pid.0, mapping.range_name()));
        (path, mapping)
    }))
}
