//! Target selection.
//!
//! By name the first matching process wins. By port every candidate is
//! inspected in turn and classified:
//!
//! ```text
//! inspection failed / skipped  -> fallback
//! any non-runtime function     -> accepted (scan stops here)
//! runtime functions only       -> proxy
//! ```
//!
//! Without an accepted candidate the last proxy beats the last fallback,
//! and a launcher that spawned the chosen candidate replaces it.

use log::info;

use super::{FileInfo, ProcessFinder, ProcessNamed};
use crate::domain::{DiscoveryError, Port};
use crate::inspect::{OffsetInspector, Offsets};
use crate::tracer::TracerConfig;

/// The resolved instrumentation target.
#[derive(Debug)]
pub struct Target {
    pub info: FileInfo,
    /// `None` when inspection failed, was skipped, or the target is a
    /// proxy/fallback selection
    pub offsets: Option<Offsets>,
}

/// Pick the owner of a port among `candidates`, inspecting them lazily.
///
/// `inspect` returns `None` when inspection failed or was skipped. Returns
/// `None` only when there are no candidates. Candidates that are not
/// selected are dropped, releasing their images.
pub fn select_port_owner<F>(mut candidates: Vec<FileInfo>, mut inspect: F) -> Option<Target>
where
    F: FnMut(&FileInfo) -> Option<Offsets>,
{
    let mut last_proxy = None;
    let mut last_fallback = None;

    for idx in 0..candidates.len() {
        match inspect(&candidates[idx]) {
            Some(offsets) if offsets.has_application_functions() => {
                let info = candidates.swap_remove(idx);
                return Some(Target { info, offsets: Some(offsets) });
            }
            Some(_) => last_proxy = Some(idx),
            None => last_fallback = Some(idx),
        }
    }

    let mut chosen = last_proxy.or(last_fallback)?;

    // Prefer the launcher over the process it spawned
    let ppid = candidates[chosen].ppid;
    if let Some(parent) = candidates.iter().position(|c| c.pid == ppid) {
        chosen = parent;
    }

    Some(Target { info: candidates.swap_remove(chosen), offsets: None })
}

/// Resolves the instrumentation target from the configured criteria.
pub struct Locator {
    finder: Box<dyn ProcessFinder>,
    inspector: Box<dyn OffsetInspector>,
    log_target: String,
}

impl Locator {
    pub fn new(
        finder: Box<dyn ProcessFinder>,
        inspector: Box<dyn OffsetInspector>,
        log_target: impl Into<String>,
    ) -> Self {
        Self { finder, inspector, log_target: log_target.into() }
    }

    /// Find the target process and, where allowed, the offsets of `functions`.
    ///
    /// # Errors
    /// Returns a [`DiscoveryError`] when no process matches, or when the
    /// process tables cannot be read.
    pub fn locate(
        &self,
        config: &TracerConfig,
        functions: &[&str],
    ) -> Result<Target, DiscoveryError> {
        match (config.port, config.exec_name.as_deref()) {
            (Some(port), _) => self.locate_by_port(config, port, functions),
            (None, Some(name)) => self.locate_by_name(config, &ProcessNamed::new(name), functions),
            (None, None) => Err(DiscoveryError::NoCriteria),
        }
    }

    fn locate_by_name(
        &self,
        config: &TracerConfig,
        named: &ProcessNamed,
        functions: &[&str],
    ) -> Result<Target, DiscoveryError> {
        let candidates = self.finder.find_by_name(named)?;
        let Some(info) = candidates.into_iter().next() else {
            return Err(DiscoveryError::NoMatchingExecutable(named.to_string()));
        };

        let lt = self.log_target.as_str();
        let offsets = if config.system_wide {
            None
        } else if config.skip_go_specific_tracers {
            info!(target: lt, "skipping inspection for Go functions, using only generic instrumentation ({}, {})", info.pid, info.cmd_exe_path.display());
            None
        } else {
            info!(target: lt, "inspecting {} ({})", info.pid, info.cmd_exe_path.display());
            match self.inspector.inspect(&info, functions) {
                Ok(offsets) => Some(offsets),
                Err(e) => {
                    info!(target: lt, "Go HTTP/gRPC support not detected, using only generic instrumentation: {e:#}");
                    None
                }
            }
        };

        Ok(Target { info, offsets })
    }

    fn locate_by_port(
        &self,
        config: &TracerConfig,
        port: Port,
        functions: &[&str],
    ) -> Result<Target, DiscoveryError> {
        let candidates = self.finder.find_by_port(port)?;
        let lt = self.log_target.as_str();
        let skip = config.skip_go_specific_tracers || config.system_wide;

        let target = select_port_owner(candidates, |candidate| {
            if skip {
                info!(target: lt, "skipping inspection for Go functions ({}, {})", candidate.pid, candidate.cmd_exe_path.display());
            } else {
                info!(target: lt, "inspecting {} ({})", candidate.pid, candidate.cmd_exe_path.display());
                match self.inspector.inspect(candidate, functions) {
                    Ok(offsets) => {
                        if !offsets.has_application_functions() {
                            info!(target: lt, "ignoring Go proxy for now ({})", candidate.pid);
                        }
                        return Some(offsets);
                    }
                    Err(e) => info!(target: lt, "inspection of {} failed: {e:#}", candidate.pid),
                }
            }
            info!(target: lt, "adding fall-back generic executable ({}, {})", candidate.pid, candidate.cmd_exe_path.display());
            None
        })
        .ok_or(DiscoveryError::NoSuitableProcess(port))?;

        if target.offsets.is_none() {
            info!(target: lt, "Go HTTP/gRPC support not detected, using only generic instrumentation");
        }
        info!(target: lt, "instrumented {} ({})", target.info.pid, target.info.cmd_exe_path.display());
        Ok(target)
    }
}
