//! OpenSSL read/write hooks, seeing plaintext before encryption.
//!
//! Targets that do not load libssl get none of these hooks.

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
    Closer, Constants, FunctionPrograms, ModuleProbes, ProbeTable, ProgramObject, Tracer, TracerConfig,
};

pub const NAME: &str = "tls";

pub const LIBSSL: &str = "libssl.so";

pub struct Tls {
    base: UnitBase,
}

impl Tls {
    #[must_use]
    pub fn new(config: &TracerConfig, log_target: &str) -> Self {
        Self { base: UnitBase::new(NAME, config, log_target) }
    }
}

#[async_trait]
impl Tracer for Tls {
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
        Vec::new()
    }

    fn uprobes(&self) -> ModuleProbes {
        vec![(
            LIBSSL,
            vec![
                ("SSL_read", FunctionPrograms::optional("uprobe_ssl_read", Some("uretprobe_ssl_read"))),
                ("SSL_write", FunctionPrograms::optional("uprobe_ssl_write", Some("uretprobe_ssl_write"))),
                (
                    "SSL_do_handshake",
                    FunctionPrograms::optional("uprobe_ssl_do_handshake", Some("uretprobe_ssl_do_handshake")),
                ),
            ],
        )]
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
