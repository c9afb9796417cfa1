//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the raw records written by the kernel-side instrumentation units
//! into their `events` ring buffer. All types use `#[repr(C)]` so that the
//! userspace decoder and the eBPF objects agree on the memory layout.
//!
//! ## Key Types
//!
//! - [`HttpRequestTrace`] - One finished HTTP or gRPC request
//! - [`GoroutineMetadata`] - Goroutine parent tracking entry (map value only)

#![no_std]

// ============================================================================
// Event Type Constants
// ============================================================================

/// Incoming HTTP request handled by the instrumented process.
pub const EVENT_HTTP_REQUEST: u8 = 1;

/// Incoming gRPC call handled by the instrumented process.
pub const EVENT_GRPC_REQUEST: u8 = 2;

/// Outgoing HTTP request issued by the instrumented process.
pub const EVENT_HTTP_CLIENT: u8 = 3;

/// Outgoing gRPC call issued by the instrumented process.
pub const EVENT_GRPC_CLIENT: u8 = 4;

/// Maximum length of the request method, NUL padded.
pub const METHOD_MAX_LEN: usize = 7;

/// Maximum length of the request path, NUL padded.
pub const PATH_MAX_LEN: usize = 100;

/// Size of an IPv6 address in bytes; IPv4 addresses are stored mapped.
pub const ADDR_LEN: usize = 16;

/// Length of a task command name (`TASK_COMM_LEN`).
pub const COMM_LEN: usize = 16;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Finished request, sent from eBPF to userspace via ring buffer.
///
/// Written once per request when the return probe (or the socket filter)
/// observes the end of the exchange. Timestamps come from
/// `bpf_ktime_get_ns()` and are monotonic since boot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HttpRequestTrace {
    /// Event type (see `EVENT_*` constants)
    pub event_type: u8,

    /// Request method (`GET`, `POST`...) or empty for gRPC
    pub method: [u8; METHOD_MAX_LEN],

    /// Request path, or full gRPC method name
    pub path: [u8; PATH_MAX_LEN],

    /// HTTP status code, or gRPC status
    pub status: u16,

    /// Peer address (IPv4-mapped when applicable)
    pub remote_addr: [u8; ADDR_LEN],

    /// Local address
    pub host_addr: [u8; ADDR_LEN],

    /// Local port the request was received on (or sent to, for clients)
    pub host_port: u32,

    /// Request body length, -1 when unknown
    pub content_length: i64,

    /// Start of the goroutine or thread that served the request
    pub go_start_monotime_ns: u64,

    /// Start of the request
    pub start_monotime_ns: u64,

    /// End of the request
    pub end_monotime_ns: u64,

    /// Process ID (TGID) that served the request
    pub pid: u32,

    /// Command name of the serving process, used in system-wide mode
    pub comm: [u8; COMM_LEN],

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],
}

/// Goroutine parent tracking entry.
///
/// Maintained by the Go runtime unit in its `ongoing_goroutines` map so that
/// other units can link a request to the goroutine that spawned it.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GoroutineMetadata {
    /// Address of the parent goroutine
    pub parent: u64,

    /// Creation timestamp of the goroutine
    pub timestamp: u64,
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for HttpRequestTrace {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for GoroutineMetadata {}
