//! # spanhook - eBPF request tracing for running processes
//!
//! spanhook attaches eBPF instrumentation to an already running process,
//! chosen by executable name or by the port it listens on, and turns the
//! kernel-side records into request spans. Go services get dedicated hooks
//! at the offsets of their HTTP and gRPC functions; everything else is
//! covered by generic kernel and library hooks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Target Process                            │
//! │            (Go service, or any HTTP speaking process)           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobes / kprobes / socket filter
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 eBPF Objects (one per unit)                     │
//! │  • nethttp, grpc, goruntime: offsets inside the executable      │
//! │  • httpfltr: kernel socket hooks + packet filter                │
//! │  • tls: libssl symbols                                          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer records
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     spanhook (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Discovery   │──▶│   Tracer     │──▶│  Forwarders  │──▶ spans│
//! │  │  + Inspect   │   │ (attach all) │   │ (per unit)   │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`discovery`]: find candidate processes in `/proc`, pick the target
//!   (by name, or by port with the proxy heuristic)
//! - [`inspect`]: resolve function offsets from the executable's symbol
//!   table, and shared module mappings from `/proc/<pid>/maps`
//! - [`tracer`]: the unit contract, capability filter, attachment engine,
//!   aya backend and the [`tracer::ProcessTracer`] orchestrator
//! - [`units`]: the concrete instrumentation units
//! - [`span`]: decoded request spans
//! - [`preflight`]: privilege, kernel and bpffs checks
//! - [`cli`]: command-line arguments
//! - [`domain`]: core types (Pid, Port) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Trace the process named checkout
//! sudo ./spanhook --exec-name checkout
//!
//! # Trace whoever owns port 8080, for one minute
//! sudo ./spanhook --port 8080 --duration 60
//! ```

pub mod cli;
pub mod discovery;
pub mod domain;
pub mod inspect;
pub mod preflight;
pub mod span;
pub mod tracer;
pub mod units;
