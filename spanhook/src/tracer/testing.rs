//! In-memory units, backend and collaborators for orchestration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use aya::Ebpf;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use super::closer::testing::RecordingCloser;
use super::{
    Backend, Closer, Closers, Constants, FunctionPrograms, ModuleProbes, ProbeTable, ProgramObject,
    Tracer,
};
use crate::discovery::{ExecImage, FileInfo, ProcessFinder, ProcessNamed};
use crate::domain::{Pid, Port};
use crate::inspect::{FuncOffsets, OffsetInspector, Offsets};
use crate::span::Span;

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn target_info(pid: i32, exe: &str) -> FileInfo {
    FileInfo {
        pid: Pid(pid),
        ppid: Pid(1),
        cmd_exe_path: PathBuf::from(format!("/usr/bin/{exe}")),
        pro_exe_link_path: PathBuf::from(format!("/proc/{pid}/exe")),
        image: ExecImage::from(b"\x7fELF".to_vec()),
    }
}

pub struct FakeUnit {
    name: &'static str,
    go: ProbeTable,
    kernel: ProbeTable,
    modules: ModuleProbes,
    filters: Vec<&'static str>,
    constants: Constants,
    fail_load: bool,
    emit: Vec<Span>,
    closers: Closers,
    journal: Journal,
    ebpf: Option<Ebpf>,
}

impl FakeUnit {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            go: Vec::new(),
            kernel: Vec::new(),
            modules: Vec::new(),
            filters: Vec::new(),
            constants: Constants::new(),
            fail_load: false,
            emit: Vec::new(),
            closers: Closers::default(),
            journal: Journal::default(),
            ebpf: None,
        }
    }

    pub fn with_go_probe(mut self, function: &'static str, programs: FunctionPrograms) -> Self {
        self.go.push((function, programs));
        self
    }

    pub fn with_kprobe(mut self, function: &'static str, programs: FunctionPrograms) -> Self {
        self.kernel.push((function, programs));
        self
    }

    pub fn with_uprobes(mut self, module: &'static str, probes: ProbeTable) -> Self {
        self.modules.push((module, probes));
        self
    }

    pub fn with_socket_filter(mut self, program: &'static str) -> Self {
        self.filters.push(program);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn emitting(mut self, spans: Vec<Span>) -> Self {
        self.emit = spans;
        self
    }

    /// Record `close:<name>` into `journal` when the unit is closed.
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Arc::clone(journal);
        self
    }

    pub fn closer_count(&self) -> usize {
        self.closers.len()
    }
}

#[async_trait]
impl Tracer for FakeUnit {
    fn name(&self) -> &'static str {
        self.name
    }

    fn load(&self) -> Result<ProgramObject> {
        if self.fail_load {
            bail!("{}.bpf.o: no such file", self.name);
        }
        let symbols: Vec<&str> = self.constants.keys().copied().collect();
        Ok(ProgramObject::fake(self.name, &symbols))
    }

    fn constants(&self, _info: &FileInfo, _offsets: Option<&Offsets>) -> Constants {
        self.constants.clone()
    }

    fn assign(&mut self, ebpf: Ebpf) {
        self.ebpf = Some(ebpf);
    }

    fn objects(&mut self) -> Option<&mut Ebpf> {
        self.ebpf.as_mut()
    }

    fn go_probes(&self) -> ProbeTable {
        self.go.clone()
    }

    fn kprobes(&self) -> ProbeTable {
        self.kernel.clone()
    }

    fn uprobes(&self) -> ModuleProbes {
        self.modules.clone()
    }

    fn socket_filters(&self) -> Vec<&'static str> {
        self.filters.clone()
    }

    fn add_closer(&mut self, closer: Box<dyn Closer>) {
        self.closers.push(closer);
    }

    fn close(&mut self) -> Result<()> {
        self.journal.lock().unwrap().push(format!("close:{}", self.name));
        self.closers.close_all()
    }

    async fn run(&mut self, cancel: CancellationToken, out: Sender<Vec<Span>>, service_name: String) {
        if !self.emit.is_empty() {
            let batch = self
                .emit
                .iter()
                .cloned()
                .map(|mut span| {
                    span.service_name.clone_from(&service_name);
                    span
                })
                .collect();
            let _ = out.send(batch).await;
        }
        cancel.cancelled().await;
    }
}

/// Records every successful call; fails the calls naming `fail_on`.
#[derive(Default)]
pub struct FakeBackend {
    calls: Journal,
    released: Journal,
    fail_on: Option<String>,
    unmapped: Vec<String>,
}

impl FakeBackend {
    /// Fail every attach of `program`, and the create step of a unit named
    /// `program`.
    pub fn failing_on(program: &str) -> Self {
        Self { fail_on: Some(program.to_string()), ..Self::default() }
    }

    /// Report `module` as not loaded by any target.
    pub fn without_module(mut self, module: &str) -> Self {
        self.unmapped.push(module.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_handle(&self) -> Journal {
        Arc::clone(&self.calls)
    }

    pub fn released_handle(&self) -> Journal {
        Arc::clone(&self.released)
    }

    fn record(&self, program: &str, call: String) -> Result<Box<dyn Closer>> {
        if self.fail_on.as_deref() == Some(program) {
            bail!("{program}: invalid argument");
        }
        self.calls.lock().unwrap().push(call.clone());
        Ok(RecordingCloser::boxed(&call, false, &self.released))
    }
}

impl Backend for FakeBackend {
    fn create(&mut self, unit: &mut dyn Tracer, _object: &ProgramObject, _constants: &Constants) -> Result<()> {
        let name = unit.name();
        if self.fail_on.as_deref() == Some(name) {
            bail!("{name}: verifier rejected program");
        }
        self.calls.lock().unwrap().push(format!("create:{name}"));
        Ok(())
    }

    fn attach_offset(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        _target: &Path,
        offset: u64,
    ) -> Result<Box<dyn Closer>> {
        self.record(program, format!("offset:{}:{program}@{offset:#x}", unit.name()))
    }

    fn attach_symbol(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        target: &Path,
        symbol: &str,
        pid: Pid,
    ) -> Result<Box<dyn Closer>> {
        self.record(
            program,
            format!("symbol:{}:{program}@{}:{symbol}:{}", unit.name(), target.display(), pid.0),
        )
    }

    fn attach_kprobe(&mut self, unit: &mut dyn Tracer, program: &str, function: &str) -> Result<Box<dyn Closer>> {
        self.record(program, format!("kprobe:{}:{program}@{function}", unit.name()))
    }

    fn attach_socket_filter(&mut self, unit: &mut dyn Tracer, program: &str) -> Result<Box<dyn Closer>> {
        self.record(program, format!("socket:{}:{program}", unit.name()))
    }

    fn resolve_module(&self, _pid: Pid, module: &str) -> Result<Option<PathBuf>> {
        if self.unmapped.iter().any(|m| m == module) {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(format!("/fake/{module}"))))
    }
}

/// Returns the same candidates for any criteria.
pub struct StaticFinder(pub Vec<FileInfo>);

impl ProcessFinder for StaticFinder {
    fn find_by_name(&self, _named: &ProcessNamed) -> Result<Vec<FileInfo>> {
        Ok(self.0.clone())
    }

    fn find_by_port(&self, _port: Port) -> Result<Vec<FileInfo>> {
        Ok(self.0.clone())
    }
}

/// Resolves a fixed set of functions for every candidate, or always fails.
pub struct StaticInspector(pub Option<Vec<&'static str>>);

impl OffsetInspector for StaticInspector {
    fn inspect(&self, _info: &FileInfo, _functions: &[&str]) -> Result<Offsets> {
        let names = self.0.as_ref().ok_or_else(|| anyhow!("no Go symbols"))?;
        Ok(names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let start = 0x1000 * (i as u64 + 1);
                ((*name).to_string(), FuncOffsets { start, returns: vec![start + 0x80] })
            })
            .collect())
    }
}
