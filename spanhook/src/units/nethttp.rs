//! net/http server and client hooks.

use anyhow::Result;
use async_trait::async_trait;
use aya::Ebpf;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::UnitBase;
use crate::discovery::FileInfo;
use crate::inspect::Offsets;
use crate::span::Span;
use crate::tracer::{Closer, Constants, FunctionPrograms, ProbeTable, ProgramObject, Tracer, TracerConfig};

pub const NAME: &str = "nethttp";

pub const SERVE_HTTP: &str = "net/http.HandlerFunc.ServeHTTP";
pub const ROUND_TRIP: &str = "net/http.(*Transport).roundTrip";
pub const WRITE_HEADER: &str = "net/http.(*response).WriteHeader";

pub struct NetHttp {
    base: UnitBase,
}

impl NetHttp {
    #[must_use]
    pub fn new(config: &TracerConfig, log_target: &str) -> Self {
        Self { base: UnitBase::new(NAME, config, log_target) }
    }
}

#[async_trait]
impl Tracer for NetHttp {
    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn load(&self) -> Result<ProgramObject> {
        self.base.load()
    }

    fn constants(&self, _info: &FileInfo, _offsets: Option<&Offsets>) -> Constants {
        self.base.common_constants()
    }

    fn assign(&mut self, ebpf: Ebpf) {
        self.base.assign(ebpf);
    }

    fn objects(&mut self) -> Option<&mut Ebpf> {
        self.base.objects()
    }

    fn go_probes(&self) -> ProbeTable {
        vec![
            (SERVE_HTTP, FunctionPrograms::required("uprobe_ServeHTTP", Some("uprobe_ServeHTTP_return"))),
            (ROUND_TRIP, FunctionPrograms::optional("uprobe_roundTrip", Some("uprobe_roundTrip_return"))),
            (WRITE_HEADER, FunctionPrograms::optional("uprobe_WriteHeader", None)),
        ]
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
