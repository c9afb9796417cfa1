//! Goroutine creation and exit tracking.
//!
//! Links requests to the goroutine that spawned them. Shares its maps with
//! the other Go units through the pin path and produces no spans itself.

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

pub const NAME: &str = "goruntime";

pub const NEWPROC1: &str = "runtime.newproc1";
pub const GOEXIT1: &str = "runtime.goexit1";

pub struct GoRuntime {
    base: UnitBase,
}

impl GoRuntime {
    #[must_use]
    pub fn new(config: &TracerConfig, log_target: &str) -> Self {
        Self { base: UnitBase::new(NAME, config, log_target) }
    }
}

#[async_trait]
impl Tracer for GoRuntime {
    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn load(&self) -> Result<ProgramObject> {
        self.base.load()
    }

    fn constants(&self, _info: &FileInfo, _offsets: Option<&Offsets>) -> Constants {
        Constants::new()
    }

    fn assign(&mut self, ebpf: Ebpf) {
        self.base.assign(ebpf);
    }

    fn objects(&mut self) -> Option<&mut Ebpf> {
        self.base.objects()
    }

    fn go_probes(&self) -> ProbeTable {
        vec![
            (NEWPROC1, FunctionPrograms::optional("uprobe_proc_newproc1", Some("uprobe_proc_newproc1_ret"))),
            (GOEXIT1, FunctionPrograms::optional("uprobe_proc_goexit1", None)),
        ]
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.base.add_closer(closer);
    }

    fn close(&mut self) -> Result<()> {
        self.base.close()
    }

    async fn run(&mut self, cancel: CancellationToken, _out: Sender<Vec<Span>>, _service_name: String) {
        cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::filter::missing_required;

    #[test]
    fn test_usable_without_offsets() {
        let unit = GoRuntime::new(&TracerConfig::default(), "test");
        assert_eq!(missing_required(&unit, None), None);
        assert!(unit.go_probes().iter().all(|(f, _)| f.starts_with(crate::inspect::RUNTIME_PREFIX)));
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let mut unit = GoRuntime::new(&TracerConfig::default(), "test");
        let cancel = CancellationToken::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        cancel.cancel();
        unit.run(cancel, tx, String::new()).await;
        unit.close().unwrap();
    }
}
