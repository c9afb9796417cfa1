//! Structured error types for spanhook
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::fmt;

use super::types::Port;
use thiserror::Error;

/// Failure to find something to instrument. Recoverable: the run is logged
/// and ends without instrumentation.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("looking for executable: no process matching '{0}' found")]
    NoMatchingExecutable(String),

    #[error("looking for executable: no suitable process owns port {0}")]
    NoSuitableProcess(Port),

    #[error("looking for executable: either an executable name or a port must be configured")]
    NoCriteria,

    #[error("looking for executable: {0}")]
    Scan(#[from] anyhow::Error),
}

/// Kind of hook being attached when an attachment fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Function hooks placed at offsets inside the target executable
    InProcess,
    /// Kernel function hooks (kprobes / kretprobes)
    Kernel,
    /// Symbol hooks inside a shared module mapped by the target
    Module,
    /// Socket-level packet filters
    SocketFilter,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::InProcess => "in-process probes",
            HookKind::Kernel => "kernel probes",
            HookKind::Module => "module probes",
            HookKind::SocketFilter => "socket filters",
        };
        f.write_str(name)
    }
}

/// Phase of the load/attach sequence a unit failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading and validating the eBPF object
    Load,
    /// Rewriting the object constants
    Constants,
    /// Creating the kernel-side collection (maps, BTF relocations)
    Create,
    /// Attaching one category of hooks
    Attach(HookKind),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Load => f.write_str("loading eBPF program"),
            Phase::Constants => f.write_str("rewriting BPF constants definition"),
            Phase::Create => f.write_str("loading and assigning BPF objects"),
            Phase::Attach(kind) => write!(f, "attaching {kind}"),
        }
    }
}

/// Fatal orchestration errors, surfaced to the caller of
/// [`ProcessTracer::start`](crate::tracer::ProcessTracer::start).
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("{unit}: {phase}: {source:#}")]
    Unit {
        unit: String,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("tracer already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TracerError {
    /// Wrap `source` with the identity of the failing unit and phase.
    pub fn unit(unit: &str, phase: Phase, source: impl Into<anyhow::Error>) -> Self {
        TracerError::Unit { unit: unit.to_string(), phase, source: source.into() }
    }

    /// Phase that failed, for unit errors.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TracerError::Unit { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_error_display() {
        let err = DiscoveryError::NoSuitableProcess(Port(8080));
        assert_eq!(err.to_string(), "looking for executable: no suitable process owns port 8080");
    }

    #[test]
    fn test_unit_error_identifies_unit_and_phase() {
        let err = TracerError::unit(
            "httpfltr",
            Phase::Attach(HookKind::Kernel),
            anyhow::anyhow!("kprobe tcp_connect not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("httpfltr"));
        assert!(msg.contains("attaching kernel probes"));
        assert!(msg.contains("tcp_connect"));
        assert_eq!(err.phase(), Some(Phase::Attach(HookKind::Kernel)));
    }
}
