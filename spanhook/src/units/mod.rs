//! # Instrumentation Units
//!
//! Concrete [`Tracer`] implementations. Each unit reads its compiled object
//! `<name>.bpf.o` from the configured BPF directory.
//!
//! | Unit        | Hooks                            | Needs Go offsets |
//! |-------------|----------------------------------|------------------|
//! | `nethttp`   | net/http server and client       | yes              |
//! | `grpc`      | grpc-go server and client        | yes              |
//! | `goruntime` | goroutine creation and exit      | no               |
//! | `httpfltr`  | kernel socket hooks, packet filter | no             |
//! | `tls`       | libssl read/write                | no               |

pub mod goruntime;
pub mod grpc;
pub mod httpfltr;
pub mod nethttp;
pub mod tls;

use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use aya::Ebpf;
use log::{debug, warn};
use spanhook_common::HttpRequestTrace;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::domain::TracerError;
use crate::span::Span;
use crate::tracer::forwarder::{forward_events, BatchConfig};
use crate::tracer::{Closer, Closers, ConstValue, Constants, ProgramObject, Tracer, TracerConfig};

/// Name of the ring buffer every unit writes its records to
pub const EVENTS_MAP: &str = "events";

/// State shared by every unit: object location, kernel collection, handles.
pub struct UnitBase {
    name: &'static str,
    object_path: PathBuf,
    ebpf: Option<Ebpf>,
    closers: Closers,
    batch: BatchConfig,
    log_target: String,
}

impl UnitBase {
    #[must_use]
    pub fn new(name: &'static str, config: &TracerConfig, log_target: &str) -> Self {
        Self {
            name,
            object_path: config.bpf_dir.join(format!("{name}.bpf.o")),
            ebpf: None,
            closers: Closers::default(),
            batch: BatchConfig { length: config.batch_length, timeout: config.batch_timeout },
            log_target: log_target.to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read the unit's object from disk.
    ///
    /// # Errors
    /// Returns an error when the object is missing or not an eBPF object.
    pub fn load(&self) -> Result<ProgramObject> {
        ProgramObject::from_file(&self.object_path)
    }

    /// Constants every event-producing object declares: the ring buffer
    /// wakes userspace up once roughly a batch worth of records is queued.
    #[must_use]
    pub fn common_constants(&self) -> Constants {
        let record = std::mem::size_of::<HttpRequestTrace>();
        let wakeup = u32::try_from(self.batch.length.saturating_mul(record)).unwrap_or(u32::MAX);
        Constants::from([("wakeup_data_bytes", ConstValue::U32(wakeup))])
    }

    pub fn assign(&mut self, ebpf: Ebpf) {
        self.ebpf = Some(ebpf);
    }

    pub fn objects(&mut self) -> Option<&mut Ebpf> {
        self.ebpf.as_mut()
    }

    pub fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.closers.push(closer);
    }

    /// Release the attachment handles, then the kernel collection.
    ///
    /// # Errors
    /// Returns the first release error.
    pub fn close(&mut self) -> Result<()> {
        let result = self.closers.close_all();
        self.ebpf = None;
        result
    }

    /// Forward the `events` ring buffer until cancelled.
    pub async fn forward(&mut self, cancel: &CancellationToken, out: &Sender<Vec<Span>>, service_name: &str) {
        let ring_buf = self.take_ring_buf();
        let lt = self.log_target.as_str();
        let ring_buf = match ring_buf {
            Ok(ring_buf) => ring_buf,
            Err(e) => {
                warn!(target: lt, "{}: {e:#}", self.name);
                return;
            }
        };

        debug!(target: lt, "{}: forwarding spans", self.name);
        if let Err(e) = forward_events(ring_buf, self.batch, service_name, cancel, out, lt).await {
            warn!(target: lt, "{}: stopped forwarding: {e:#}", self.name);
        }
    }

    fn take_ring_buf(&mut self) -> Result<RingBuf<aya::maps::MapData>> {
        let ebpf = self.ebpf.as_mut().context("BPF objects not loaded")?;
        let map = ebpf.take_map(EVENTS_MAP).context("events map not found")?;
        RingBuf::try_from(map).context("creating ring buffer from events map")
    }
}

/// Instantiate the units named in the configuration, in order.
///
/// # Errors
/// Returns [`TracerError::InvalidConfig`] for unknown unit names.
pub fn build_units(config: &TracerConfig, log_target: &str) -> Result<Vec<Box<dyn Tracer>>, TracerError> {
    config
        .tracers
        .iter()
        .map(|name| -> Result<Box<dyn Tracer>, TracerError> {
            Ok(match name.as_str() {
                nethttp::NAME => Box::new(nethttp::NetHttp::new(config, log_target)),
                grpc::NAME => Box::new(grpc::Grpc::new(config, log_target)),
                goruntime::NAME => Box::new(goruntime::GoRuntime::new(config, log_target)),
                httpfltr::NAME => Box::new(httpfltr::HttpFilter::new(config, log_target)),
                tls::NAME => Box::new(tls::Tls::new(config, log_target)),
                other => {
                    return Err(TracerError::InvalidConfig(format!("unknown tracer '{other}'")))
                }
            })
        })
        .collect()
}
