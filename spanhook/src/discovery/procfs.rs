//! `/proc` backed process finder.
//!
//! By name: matches `/proc/<pid>/stat` command names and `/proc/<pid>/exe`
//! basenames. By port: reads each process's own `/proc/<pid>/net/tcp{,6}`,
//! which reflects that process's network namespace, and keeps the processes
//! holding a descriptor on one of the listening sockets.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::debug;

use super::{ExecImage, FileInfo, ProcessFinder, ProcessNamed};
use crate::domain::{Pid, Port};

/// TCP state code of a listening socket in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Finder reading a procfs mount, `/proc` by default.
#[derive(Debug, Clone)]
pub struct ProcFinder {
    root: PathBuf,
}

impl Default for ProcFinder {
    fn default() -> Self {
        Self { root: PathBuf::from("/proc") }
    }
}

impl ProcFinder {
    /// Finder over an alternative procfs root (e.g. a host `/proc` mounted
    /// into a container).
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Numeric entries of the procfs root, ascending.
    fn pids(&self) -> Result<Vec<i32>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?;
        let mut pids: Vec<i32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn exe_link(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string()).join("exe")
    }

    /// Command name and parent pid of a process, `None` if it vanished.
    fn stat(&self, pid: i32) -> Option<(String, i32)> {
        let content = fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let command = extract_comm(&content).ok()?;
        let ppid = extract_ppid(&content).ok()?;
        Some((command, ppid))
    }

    /// Build the descriptor for `pid`, reading its executable image.
    fn describe(&self, pid: i32, exe_path: PathBuf, ppid: i32) -> Option<FileInfo> {
        let link = self.exe_link(pid);
        let image = match fs::read(&link) {
            Ok(data) => ExecImage::from(data),
            Err(e) => {
                debug!("skipping pid {pid}: cannot read {}: {e}", link.display());
                return None;
            }
        };
        Some(FileInfo {
            pid: Pid(pid),
            ppid: Pid(ppid),
            cmd_exe_path: exe_path,
            pro_exe_link_path: link,
            image,
        })
    }

    /// Inodes of the sockets listening on `port` in the network namespace
    /// of `pid`, IPv4 and IPv6.
    fn listening_inodes(&self, pid: i32, port: Port) -> HashSet<u64> {
        let net = self.root.join(pid.to_string()).join("net");
        let mut inodes = HashSet::new();
        for table in ["tcp", "tcp6"] {
            let path = net.join(table);
            match fs::read_to_string(&path) {
                Ok(content) => inodes.extend(parse_listening_inodes(&content, port.0)),
                Err(e) => debug!("cannot read {}: {e}", path.display()),
            }
        }
        inodes
    }

    /// Namespace identity of `pid`, e.g. `net:[4026531840]`. Processes
    /// sharing it share socket tables.
    fn net_namespace(&self, pid: i32) -> Option<String> {
        let link = fs::read_link(self.root.join(pid.to_string()).join("ns").join("net")).ok()?;
        Some(link.to_string_lossy().into_owned())
    }

    /// True when one of the open descriptors of `pid` is one of `inodes`.
    fn holds_socket(&self, pid: i32, inodes: &HashSet<u64>) -> bool {
        let Ok(fds) = fs::read_dir(self.root.join(pid.to_string()).join("fd")) else {
            return false;
        };
        fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| parse_socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        })
    }
}

impl ProcessFinder for ProcFinder {
    fn find_by_name(&self, named: &ProcessNamed) -> Result<Vec<FileInfo>> {
        let mut found = Vec::new();
        for pid in self.pids()? {
            // Kernel threads and inaccessible processes have no readable exe
            let Ok(exe_path) = fs::read_link(self.exe_link(pid)) else {
                continue;
            };
            let Some((command, ppid)) = self.stat(pid) else {
                continue;
            };
            if !named.matches(&command, &exe_path) {
                continue;
            }
            if let Some(info) = self.describe(pid, exe_path, ppid) {
                found.push(info);
            }
        }
        Ok(found)
    }

    fn find_by_port(&self, port: Port) -> Result<Vec<FileInfo>> {
        let mut by_namespace: HashMap<String, HashSet<u64>> = HashMap::new();
        let mut found = Vec::new();
        for pid in self.pids()? {
            let own;
            let inodes = match self.net_namespace(pid) {
                Some(ns) => &*by_namespace.entry(ns).or_insert_with(|| self.listening_inodes(pid, port)),
                None => {
                    own = self.listening_inodes(pid, port);
                    &own
                }
            };
            if inodes.is_empty() || !self.holds_socket(pid, inodes) {
                continue;
            }
            let Ok(exe_path) = fs::read_link(self.exe_link(pid)) else {
                continue;
            };
            let Some((_, ppid)) = self.stat(pid) else {
                continue;
            };
            if let Some(info) = self.describe(pid, exe_path, ppid) {
                found.push(info);
            }
        }
        if found.is_empty() {
            debug!("no process listening on port {port}");
        }
        Ok(found)
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ppid ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Extract the parent pid, the second field after the command name.
fn extract_ppid(stat_line: &str) -> Result<i32> {
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    let ppid = stat_line[close + 1..].split_whitespace().nth(1).context("Missing ppid field")?;
    ppid.parse().with_context(|| format!("Invalid ppid '{ppid}'"))
}

/// Inodes of listening sockets bound to `port` in a `/proc/net/tcp{,6}` table.
///
/// Row layout: `sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode ...`
/// with `local_address` as `HEXADDR:HEXPORT`.
fn parse_listening_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, local_port) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(local_port, 16).ok()? != port {
                return None;
            }
            fields[9].parse().ok()
        })
        .collect()
}

/// Inode of a `socket:[N]` descriptor link.
fn parse_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}
