//! Language-agnostic HTTP tracing.
//!
//! Kernel socket hooks track connections of the target (or of every process
//! in system-wide mode) and a socket filter parses HTTP off the wire.

use anyhow::Result;
use async_trait::async_trait;
use aya::Ebpf;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::UnitBase;
use crate::discovery::FileInfo;
use crate::inspect::Offsets;
use crate::span::Span;
use crate::tracer::{
    Closer, ConstValue, Constants, FunctionPrograms, ProbeTable, ProgramObject, Tracer, TracerConfig,
};

pub const NAME: &str = "httpfltr";

pub const SOCKET_FILTER: &str = "socket__http_filter";

pub struct HttpFilter {
    base: UnitBase,
    system_wide: bool,
}

impl HttpFilter {
    #[must_use]
    pub fn new(config: &TracerConfig, log_target: &str) -> Self {
        Self { base: UnitBase::new(NAME, config, log_target), system_wide: config.system_wide }
    }
}

#[async_trait]
impl Tracer for HttpFilter {
    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn load(&self) -> Result<ProgramObject> {
        self.base.load()
    }

    /// `filter_pid` restricts the kernel hooks to the target; 0 traces all.
    fn constants(&self, info: &FileInfo, _offsets: Option<&Offsets>) -> Constants {
        let pid = if self.system_wide { 0 } else { u32::try_from(info.pid.0).unwrap_or(0) };
        let mut constants = self.base.common_constants();
        constants.insert("filter_pid", ConstValue::U32(pid));
        constants
    }

    fn assign(&mut self, ebpf: Ebpf) {
        self.base.assign(ebpf);
    }

    fn objects(&mut self) -> Option<&mut Ebpf> {
        self.base.objects()
    }

    fn go_probes(&self) -> ProbeTable {
        Vec::new()
    }

    fn kprobes(&self) -> ProbeTable {
        vec![
            ("__sys_accept4", FunctionPrograms::required("kprobe_sys_accept4", Some("kretprobe_sys_accept4"))),
            ("tcp_rcv_established", FunctionPrograms::required("kprobe_tcp_rcv_established", None)),
            ("__sys_connect", FunctionPrograms::required("kprobe_sys_connect", Some("kretprobe_sys_connect"))),
            ("tcp_connect", FunctionPrograms::required("kprobe_tcp_connect", None)),
        ]
    }

    fn socket_filters(&self) -> Vec<&'static str> {
        vec![SOCKET_FILTER]
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.base.add_closer(closer);
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()
    }

    async fn run(&mut self, cancel: CancellationToken, out: Sender<Vec<Span>>, service_name: String) {
        self.base.forward(&cancel, &out, &service_name).await;
    }
}
