//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::Port;
use crate::tracer::config::{DEFAULT_BPF_DIR, DEFAULT_TRACERS};
use crate::tracer::TracerConfig;

#[derive(Parser, Debug)]
#[command(
    name = "spanhook",
    about = "Trace HTTP and gRPC requests of a running process with eBPF",
    after_help = "\
EXAMPLES:
    sudo spanhook --exec-name checkout            Instrument the process named checkout
    sudo spanhook --port 8080                     Instrument the owner of port 8080
    sudo spanhook --port 8080 --system-wide       Trace every process, generic units only
    sudo spanhook --exec-name api --tracers nethttp,httpfltr --duration 60"
)]
pub struct Args {
    /// Instrument the process whose executable matches this name
    #[arg(long, env = "SPANHOOK_EXEC_NAME", conflicts_with = "port")]
    pub exec_name: Option<String>,

    /// Instrument the process listening on this port
    #[arg(long, env = "SPANHOOK_PORT")]
    pub port: Option<u16>,

    /// Trace every process on the host; service names come from each request
    #[arg(long, env = "SPANHOOK_SYSTEM_WIDE")]
    pub system_wide: bool,

    /// Skip Go symbol inspection (only generic instrumentation is attached)
    #[arg(long, env = "SPANHOOK_SKIP_GO_SPECIFIC_TRACERS")]
    pub skip_go_specific_tracers: bool,

    /// Service name reported with every span (default: executable name)
    #[arg(long, env = "SPANHOOK_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Directory holding the compiled eBPF objects
    #[arg(long, env = "SPANHOOK_BPF_DIR", default_value = DEFAULT_BPF_DIR)]
    pub bpf_dir: PathBuf,

    /// bpffs directory where shared maps are pinned (mounted if needed)
    #[arg(long, env = "SPANHOOK_BPF_PIN_PATH")]
    pub bpf_pin_path: Option<PathBuf>,

    /// Comma-separated instrumentation units to enable
    #[arg(long, env = "SPANHOOK_TRACERS", value_delimiter = ',', default_values_t = DEFAULT_TRACERS.iter().map(ToString::to_string).collect::<Vec<_>>())]
    pub tracers: Vec<String>,

    /// Spans per forwarded batch
    #[arg(long, env = "SPANHOOK_BATCH_LENGTH", default_value = "100")]
    pub batch_length: usize,

    /// Maximum time a partial batch waits, in milliseconds
    #[arg(long, env = "SPANHOOK_BATCH_TIMEOUT_MS", default_value = "1000")]
    pub batch_timeout_ms: u64,

    /// Capacity of the span channel, in batches
    #[arg(long, env = "SPANHOOK_CHANNEL_CAPACITY", default_value = "64")]
    pub channel_capacity: usize,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, env = "SPANHOOK_DURATION", default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Tracer configuration described by the arguments. Not validated.
    #[must_use]
    pub fn to_config(&self) -> TracerConfig {
        TracerConfig {
            exec_name: self.exec_name.clone(),
            port: self.port.map(Port),
            system_wide: self.system_wide,
            skip_go_specific_tracers: self.skip_go_specific_tracers,
            service_name: self.service_name.clone(),
            bpf_dir: self.bpf_dir.clone(),
            bpf_pin_path: self.bpf_pin_path.clone(),
            tracers: self.tracers.clone(),
            batch_length: self.batch_length,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            channel_capacity: self.channel_capacity,
        }
    }

    /// Run duration, `None` when unlimited
    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}
