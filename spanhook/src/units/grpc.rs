//! grpc-go server and client hooks.

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

pub const NAME: &str = "grpc";

pub const HANDLE_STREAM: &str = "google.golang.org/grpc.(*Server).handleStream";
pub const WRITE_STATUS: &str = "google.golang.org/grpc/internal/transport.(*http2Server).WriteStatus";
pub const CLIENT_INVOKE: &str = "google.golang.org/grpc.(*ClientConn).Invoke";

pub struct Grpc {
    base: UnitBase,
}

impl Grpc {
    #[must_use]
    pub fn new(config: &TracerConfig, log_target: &str) -> Self {
        Self { base: UnitBase::new(NAME, config, log_target) }
    }
}

#[async_trait]
impl Tracer for Grpc {
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
            (
                HANDLE_STREAM,
                FunctionPrograms::required("uprobe_server_handleStream", Some("uprobe_server_handleStream_return")),
            ),
            // Status of the call, read before handleStream returns
            (WRITE_STATUS, FunctionPrograms::required("uprobe_transport_writeStatus", None)),
            (
                CLIENT_INVOKE,
                FunctionPrograms::optional("uprobe_ClientConn_Invoke", Some("uprobe_ClientConn_Invoke_return")),
            ),
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
