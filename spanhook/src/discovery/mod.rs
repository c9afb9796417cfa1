//! # Process Discovery
//!
//! Finds the OS process to instrument and opens its executable image.
//!
//! ## Components
//!
//! - [`FileInfo`] - Descriptor of one candidate process and its binary
//! - [`ProcessFinder`] - Enumerates candidates by name or by owned port
//! - [`ProcFinder`] - `/proc` backed finder
//! - [`Locator`] - Picks the target among candidates (proxy heuristic)
//!
//! Descriptors own their image. Every candidate that is not selected is
//! dropped before [`Locator::locate`] returns, so only the target's image
//! stays in memory.

pub mod locator;
pub mod procfs;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::domain::{Pid, Port};

pub use locator::{select_port_owner, Locator, Target};
pub use procfs::ProcFinder;

/// Contents of an executable, read once during discovery.
#[derive(Clone)]
pub struct ExecImage {
    data: Arc<[u8]>,
}

impl ExecImage {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for ExecImage {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl From<Arc<[u8]>> for ExecImage {
    fn from(data: Arc<[u8]>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for ExecImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecImage({} bytes)", self.data.len())
    }
}

/// A discovered process together with its executable.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub pid: Pid,
    pub ppid: Pid,
    /// Canonical path of the executable (target of `/proc/<pid>/exe`)
    pub cmd_exe_path: PathBuf,
    /// `/proc/<pid>/exe`, stable even if the file was replaced on disk
    pub pro_exe_link_path: PathBuf,
    pub image: ExecImage,
}

impl FileInfo {
    /// Display name of the executable: the last path component.
    #[must_use]
    pub fn executable_name(&self) -> &str {
        self.cmd_exe_path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
    }
}

/// Name predicate used by by-name discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNamed(String);

impl ProcessNamed {
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.0
    }

    /// Match against the command name (from `/proc/<pid>/stat`) or the
    /// executable basename. Exact basename matches and substrings both count.
    #[must_use]
    pub fn matches(&self, command: &str, exe_path: &Path) -> bool {
        let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let pattern = self.0.as_str();
        let pattern_basename =
            Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

        command == pattern_basename
            || exe_basename == pattern_basename
            || command.contains(pattern)
            || exe_basename.contains(pattern)
    }
}

impl fmt::Display for ProcessNamed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of candidate processes.
///
/// Implementations return candidates in a stable enumeration order; the
/// locator relies on that order for its tie-breaks.
pub trait ProcessFinder: Send {
    /// All processes whose executable matches `named`.
    ///
    /// # Errors
    /// Returns an error when the process table cannot be read.
    fn find_by_name(&self, named: &ProcessNamed) -> Result<Vec<FileInfo>>;

    /// All processes owning a listening TCP socket on `port`.
    ///
    /// # Errors
    /// Returns an error when the socket or process tables cannot be read.
    fn find_by_port(&self, port: Port) -> Result<Vec<FileInfo>>;
}
