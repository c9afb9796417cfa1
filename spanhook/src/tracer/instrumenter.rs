//! Attachment engine.
//!
//! Attaches the hooks a unit declares, category by category, and registers
//! each handle on the unit as soon as it exists. A failing category leaves
//! the handles acquired so far on the unit for its teardown.
//!
//! | Category    | Missing target               | Attach failure             |
//! |-------------|------------------------------|----------------------------|
//! | In-process  | skipped                      | aborts if required         |
//! | Kernel      | n/a                          | aborts                     |
//! | Module      | module skipped               | aborts                     |
//! | Socket      | n/a                          | aborts                     |
//!
//! In-process hooks with a return program need the return offsets of the
//! function; without them the hook counts as failed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use super::{Closer, Constants, FunctionPrograms, ProgramObject, Tracer};
use crate::discovery::FileInfo;
use crate::domain::Pid;
use crate::inspect::memory_maps::resolve_module_path;
use crate::inspect::{FuncOffsets, Offsets};

/// Kernel-facing operations the engine and orchestrator rely on.
pub trait Backend: Send {
    /// Create the kernel-side collection of `unit` from its object and
    /// constants, and hand it to the unit.
    ///
    /// # Errors
    /// Returns an error when the kernel rejects the object.
    fn create(&mut self, unit: &mut dyn Tracer, object: &ProgramObject, constants: &Constants) -> Result<()>;

    /// Attach `program` at a file offset of `target`, for every process
    /// running it.
    ///
    /// # Errors
    /// Returns an error if the program is unknown or the attach fails.
    fn attach_offset(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        target: &Path,
        offset: u64,
    ) -> Result<Box<dyn Closer>>;

    /// Attach `program` at `symbol` of `target`, for process `pid` only.
    ///
    /// # Errors
    /// Returns an error if the program or the symbol is unknown.
    fn attach_symbol(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        target: &Path,
        symbol: &str,
        pid: Pid,
    ) -> Result<Box<dyn Closer>>;

    /// Attach `program` to kernel function `function`.
    ///
    /// # Errors
    /// Returns an error if the program or the kernel function is unknown.
    fn attach_kprobe(&mut self, unit: &mut dyn Tracer, program: &str, function: &str) -> Result<Box<dyn Closer>>;

    /// Attach `program` as a filter on a raw packet socket.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be opened or the attach fails.
    fn attach_socket_filter(&mut self, unit: &mut dyn Tracer, program: &str) -> Result<Box<dyn Closer>>;

    /// File to attach module hooks of `module` to in process `pid`, `None`
    /// when the process has not loaded the module.
    ///
    /// # Errors
    /// Returns an error if the process memory maps cannot be read.
    fn resolve_module(&self, pid: Pid, module: &str) -> Result<Option<PathBuf>> {
        let resolved = resolve_module_path(pid, module)?;
        if let Some((_, mapping)) = &resolved {
            debug!("instrumenting library {module} at {}", mapping.pathname);
        }
        Ok(resolved.map(|(path, _)| path))
    }
}

/// Attaches the hooks of one unit against one target.
pub struct Instrumenter<'a, B: ?Sized> {
    backend: &'a mut B,
    info: &'a FileInfo,
    offsets: Option<&'a Offsets>,
    log_target: &'a str,
}

impl<'a, B: Backend + ?Sized> Instrumenter<'a, B> {
    pub fn new(
        backend: &'a mut B,
        info: &'a FileInfo,
        offsets: Option<&'a Offsets>,
        log_target: &'a str,
    ) -> Self {
        Self { backend, info, offsets, log_target }
    }

    /// Hook functions of the target executable at their resolved offsets.
    ///
    /// # Errors
    /// Returns an error when a required hook cannot be attached.
    pub fn go_probes(&mut self, unit: &mut dyn Tracer) -> Result<()> {
        let name = unit.name();
        for (function, programs) in unit.go_probes() {
            let Some(offsets) = self.offsets.and_then(|o| o.get(function)) else {
                debug!(target: self.log_target, "{name}: function {function} not found, skipping");
                continue;
            };
            if let Err(e) = self.go_probe(unit, &programs, offsets) {
                if programs.required {
                    return Err(e.context(format!("instrumenting function {function:?}")));
                }
                debug!(target: self.log_target, "{name}: cannot instrument {function}: {e:#}");
            }
        }
        Ok(())
    }

    fn go_probe(
        &mut self,
        unit: &mut dyn Tracer,
        programs: &FunctionPrograms,
        offsets: &FuncOffsets,
    ) -> Result<()> {
        if let Some(end) = programs.end {
            if offsets.returns.is_empty() {
                bail!("return offsets unknown, cannot place {end}");
            }
        }

        let info = self.info;
        let exe = info.pro_exe_link_path.as_path();
        let closer = self
            .backend
            .attach_offset(unit, programs.start, exe, offsets.start)
            .context("setting uprobe")?;
        unit.add_closer(closer);

        let Some(end) = programs.end else {
            return Ok(());
        };
        for ret in &offsets.returns {
            let closer = self
                .backend
                .attach_offset(unit, end, exe, *ret)
                .with_context(|| format!("setting return uprobe at {ret:#x}"))?;
            unit.add_closer(closer);
        }
        Ok(())
    }

    /// Hook kernel functions by name.
    ///
    /// # Errors
    /// Returns an error on the first failing hook.
    pub fn kprobes(&mut self, unit: &mut dyn Tracer) -> Result<()> {
        for (function, programs) in unit.kprobes() {
            debug!(target: self.log_target, "{}: going to add kprobe to function {function}", unit.name());
            let closer = self
                .backend
                .attach_kprobe(unit, programs.start, function)
                .with_context(|| format!("setting kprobe on {function}"))?;
            unit.add_closer(closer);

            if let Some(end) = programs.end {
                let closer = self
                    .backend
                    .attach_kprobe(unit, end, function)
                    .with_context(|| format!("setting kretprobe on {function}"))?;
                unit.add_closer(closer);
            }
        }
        Ok(())
    }

    /// Hook symbols of shared modules mapped by the target. Modules the
    /// target has not loaded are skipped.
    ///
    /// # Errors
    /// Returns an error when the process maps cannot be read or a hook of a
    /// loaded module fails.
    pub fn uprobes(&mut self, unit: &mut dyn Tracer) -> Result<()> {
        let name = unit.name();
        let pid = self.info.pid;
        for (module, probes) in unit.uprobes() {
            let Some(target) = self.backend.resolve_module(pid, module)? else {
                warn!(target: self.log_target, "{name}: {module} not loaded by process {pid}, skipping its hooks");
                continue;
            };
            for (symbol, programs) in probes {
                self.module_probe(unit, &target, symbol, &programs)
                    .with_context(|| format!("instrumenting {module}:{symbol}"))?;
            }
        }
        Ok(())
    }

    fn module_probe(
        &mut self,
        unit: &mut dyn Tracer,
        target: &Path,
        symbol: &str,
        programs: &FunctionPrograms,
    ) -> Result<()> {
        let pid = self.info.pid;
        let closer = self
            .backend
            .attach_symbol(unit, programs.start, target, symbol, pid)
            .context("setting uprobe")?;
        unit.add_closer(closer);

        if let Some(end) = programs.end {
            let closer = self
                .backend
                .attach_symbol(unit, end, target, symbol, pid)
                .context("setting uretprobe")?;
            unit.add_closer(closer);
        }
        Ok(())
    }

    /// Attach the unit's socket filters.
    ///
    /// # Errors
    /// Returns an error on the first failing filter.
    pub fn socket_filters(&mut self, unit: &mut dyn Tracer) -> Result<()> {
        for program in unit.socket_filters() {
            let closer = self
                .backend
                .attach_socket_filter(unit, program)
                .with_context(|| format!("attaching socket filter {program}"))?;
            unit.add_closer(closer);
        }
        Ok(())
    }
}
