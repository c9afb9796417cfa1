//! # Instrumentation Orchestration
//!
//! Loads instrumentation units, attaches their hooks to the target and runs
//! them concurrently.
//!
//! ## Components
//!
//! - [`Tracer`] - Capability contract of an instrumentation unit
//! - [`filter`] - Which units can run given the resolved offsets
//! - [`Instrumenter`] - Attaches the four hook categories through a [`Backend`]
//! - [`AyaBackend`] - Kernel backend built on aya
//! - [`ProcessTracer`] - Locate, load, attach, run
//! - [`forwarder`] - Ring buffer to batched span channel
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Resolving -> Attaching -> Running -> Draining -> Stopped
//!            |             |
//!            |             +-- unit failure: release handles, TracerError
//!            +-- no target / no usable unit: RunOutcome
//! ```

pub mod backend;
pub mod closer;
pub mod config;
pub mod diagnostics;
pub mod filter;
pub mod forwarder;
pub mod instrumenter;
pub mod object;
pub mod process_tracer;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;
use aya::Ebpf;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::discovery::FileInfo;
use crate::inspect::Offsets;
use crate::span::Span;

pub use backend::AyaBackend;
pub use closer::{Closer, Closers};
pub use config::TracerConfig;
pub use filter::{all_go_function_names, filter_usable};
pub use instrumenter::{Backend, Instrumenter};
pub use object::{ConstValue, Constants, ProgramObject};
pub use process_tracer::{ProcessTracer, RunOutcome, State};

/// Programs hooked on one function: entry, optional return, and whether the
/// unit is useless without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionPrograms {
    pub start: &'static str,
    pub end: Option<&'static str>,
    pub required: bool,
}

impl FunctionPrograms {
    #[must_use]
    pub const fn required(start: &'static str, end: Option<&'static str>) -> Self {
        Self { start, end, required: true }
    }

    #[must_use]
    pub const fn optional(start: &'static str, end: Option<&'static str>) -> Self {
        Self { start, end, required: false }
    }
}

/// Function or symbol name -> programs.
pub type ProbeTable = Vec<(&'static str, FunctionPrograms)>;

/// Module name -> probes on symbols of that module.
pub type ModuleProbes = Vec<(&'static str, ProbeTable)>;

/// A pluggable instrumentation program.
///
/// The orchestrator only uses [`Tracer::name`] to identify a unit in logs
/// and errors; everything else is driven through this contract.
#[async_trait]
pub trait Tracer: Send {
    fn name(&self) -> &'static str;

    /// Read and validate the compiled object, without touching the kernel.
    ///
    /// # Errors
    /// Returns an error if the object is missing or invalid.
    fn load(&self) -> Result<ProgramObject>;

    /// Values of the read-only globals, derived from the target. Pure.
    fn constants(&self, info: &FileInfo, offsets: Option<&Offsets>) -> Constants;

    /// Take ownership of the kernel-side collection created from [`Tracer::load`].
    fn assign(&mut self, ebpf: Ebpf);

    fn objects(&mut self) -> Option<&mut Ebpf>;

    /// Functions of the target executable to hook, by offset.
    fn go_probes(&self) -> ProbeTable;

    /// Kernel functions to hook (kprobe / kretprobe).
    fn kprobes(&self) -> ProbeTable {
        Vec::new()
    }

    /// Symbols of shared modules to hook (uprobe / uretprobe).
    fn uprobes(&self) -> ModuleProbes {
        Vec::new()
    }

    /// Programs attached as socket filters.
    fn socket_filters(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>);

    /// Release every attachment handle of this unit.
    ///
    /// # Errors
    /// Returns the first release error.
    fn close(&mut self) -> Result<()>;

    /// Forward spans until `cancel` fires.
    ///
    /// `service_name` is empty in system-wide mode, where each span carries
    /// the name of the process that produced it.
    async fn run(&mut self, cancel: CancellationToken, out: Sender<Vec<Span>>, service_name: String);
}
