//! Spans: decoded request records forwarded downstream.
//!
//! The instrumentation units write [`HttpRequestTrace`] records into their
//! ring buffer; this module turns one record into a [`Span`] carrying the
//! service name of the run.

use std::net::{IpAddr, Ipv6Addr};

use anyhow::{bail, Result};
use serde::Serialize;
use spanhook_common::{
    HttpRequestTrace, EVENT_GRPC_CLIENT, EVENT_GRPC_REQUEST, EVENT_HTTP_CLIENT, EVENT_HTTP_REQUEST,
};

/// What the span represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    HttpServer,
    GrpcServer,
    HttpClient,
    GrpcClient,
}

impl SpanKind {
    fn from_event_type(event_type: u8) -> Option<Self> {
        match event_type {
            EVENT_HTTP_REQUEST => Some(SpanKind::HttpServer),
            EVENT_GRPC_REQUEST => Some(SpanKind::GrpcServer),
            EVENT_HTTP_CLIENT => Some(SpanKind::HttpClient),
            EVENT_GRPC_CLIENT => Some(SpanKind::GrpcClient),
            _ => None,
        }
    }
}

/// One finished request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub kind: SpanKind,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub peer: String,
    pub host: String,
    pub host_port: u32,
    pub content_length: i64,
    /// Monotonic timestamps, nanoseconds since boot
    pub go_start_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub pid: u32,
    pub service_name: String,
}

impl Span {
    /// Convert a raw record. An empty `service_name` (system-wide mode)
    /// is replaced by the command name captured with the record.
    ///
    /// # Errors
    /// Returns an error for unknown event types.
    pub fn from_trace(trace: &HttpRequestTrace, service_name: &str) -> Result<Self> {
        let Some(kind) = SpanKind::from_event_type(trace.event_type) else {
            bail!("unknown event type {}", trace.event_type);
        };

        let service_name =
            if service_name.is_empty() { c_str(&trace.comm) } else { service_name.to_string() };

        Ok(Span {
            kind,
            method: c_str(&trace.method),
            path: c_str(&trace.path),
            status: trace.status,
            peer: format_addr(trace.remote_addr),
            host: format_addr(trace.host_addr),
            host_port: trace.host_port,
            content_length: trace.content_length,
            go_start_ns: trace.go_start_monotime_ns,
            start_ns: trace.start_monotime_ns,
            end_ns: trace.end_monotime_ns,
            pid: trace.pid,
            service_name,
        })
    }

    /// Decode a ring buffer record.
    ///
    /// # Errors
    /// Returns an error when the record is truncated or of an unknown type.
    pub fn decode(bytes: &[u8], service_name: &str) -> Result<Self> {
        if bytes.len() < std::mem::size_of::<HttpRequestTrace>() {
            bail!("incomplete event: {} bytes", bytes.len());
        }
        // SAFETY: the length was checked and HttpRequestTrace is plain old data
        #[allow(unsafe_code)]
        let trace = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<HttpRequestTrace>()) };
        Self::from_trace(&trace, service_name)
    }

    /// Request duration
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Running totals over the printed spans, for the exit summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanStats {
    pub count: usize,
    total_ns: u128,
}

impl SpanStats {
    pub fn record(&mut self, span: &Span) {
        self.count += 1;
        self.total_ns += u128::from(span.duration_ns());
    }

    /// Mean request duration in milliseconds, 0 when nothing was recorded.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ns as f64 / self.count as f64 / 1_000_000.0
    }
}

/// NUL-terminated byte buffer to string
fn c_str(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// IPv4-mapped addresses are printed as IPv4
fn format_addr(bytes: [u8; 16]) -> String {
    let v6 = Ipv6Addr::from(bytes);
    let addr = v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4);
    addr.to_string()
}
