//! # Process Tracer
//!
//! Drives one instrumentation run: locate the target, keep the units it can
//! support, load and attach them one by one, then run them until cancelled.
//!
//! Attachment is all or nothing. When any unit fails, every unit processed
//! so far (the failing one included) releases its handles before the error
//! is returned.

use log::{debug, error, info, warn};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::diagnostics::print_verifier_error_info;
use super::filter::{all_go_function_names, filter_usable, missing_required};
use super::{Backend, Instrumenter, Tracer, TracerConfig};
use crate::discovery::locator::{Locator, Target};
use crate::discovery::FileInfo;
use crate::domain::{DiscoveryError, HookKind, Phase, Pid, TracerError};
use crate::inspect::Offsets;
use crate::span::Span;

/// Lifecycle of a [`ProcessTracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Resolving,
    Attaching,
    Running,
    Draining,
    Stopped,
}

/// How [`ProcessTracer::start`] ended when it did not fail.
#[derive(Debug)]
pub enum RunOutcome {
    /// Nothing matched the discovery criteria
    NoTarget(DiscoveryError),
    /// A target was found but no unit can instrument it
    NoInstrumentation { pid: Pid },
    /// Units are attached and forwarding spans
    Running { pid: Pid, service_name: String, units: Vec<&'static str> },
}

pub struct ProcessTracer<B: Backend> {
    config: TracerConfig,
    units: Vec<Box<dyn Tracer>>,
    locator: Locator,
    backend: B,
    log_target: String,
    state: State,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: Backend> ProcessTracer<B> {
    pub fn new(
        config: TracerConfig,
        units: Vec<Box<dyn Tracer>>,
        locator: Locator,
        backend: B,
        log_target: impl Into<String>,
    ) -> Self {
        Self {
            config,
            units,
            locator,
            backend,
            log_target: log_target.into(),
            state: State::Idle,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Locate the target, attach every usable unit and spawn one task per
    /// unit. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`TracerError::Unit`] when a unit fails to load or attach,
    /// and [`TracerError::AlreadyStarted`] on a second call.
    pub fn start(
        &mut self,
        cancel: &CancellationToken,
        out: &Sender<Vec<Span>>,
    ) -> Result<RunOutcome, TracerError> {
        if self.state != State::Idle {
            return Err(TracerError::AlreadyStarted);
        }

        self.state = State::Resolving;
        let functions = all_go_function_names(&self.units);
        let target = match self.locator.locate(&self.config, &functions) {
            Ok(target) => target,
            Err(e) => {
                error!(target: self.log_target.as_str(), "couldn't start process tracer: {e}");
                self.state = State::Stopped;
                return Ok(RunOutcome::NoTarget(e));
            }
        };

        let Target { info, offsets } = target;
        let units = self.usable_units(offsets.as_ref());
        if units.is_empty() {
            info!(target: self.log_target.as_str(), "no instrumentation for {} ({}), stopping", info.pid, info.cmd_exe_path.display());
            self.state = State::Stopped;
            return Ok(RunOutcome::NoInstrumentation { pid: info.pid });
        }

        self.state = State::Attaching;
        let units = match self.attach_all(units, &info, offsets.as_ref()) {
            Ok(units) => units,
            Err(e) => {
                self.state = State::Stopped;
                return Err(e);
            }
        };

        let service_name = self.service_name(&info);
        let names: Vec<&'static str> = units.iter().map(|u| u.name()).collect();
        info!(target: self.log_target.as_str(), "instrumenting {} ({}) with {}", info.pid, info.cmd_exe_path.display(), names.join(", "));

        for mut unit in units {
            let cancel = cancel.clone();
            let out = out.clone();
            let service_name = service_name.clone();
            let lt = self.log_target.clone();
            self.tasks.push(tokio::spawn(async move {
                unit.run(cancel, out, service_name).await;
                if let Err(e) = unit.close() {
                    warn!(target: lt.as_str(), "{}: closing: {e:#}", unit.name());
                }
                debug!(target: lt.as_str(), "{}: stopped", unit.name());
            }));
        }

        self.state = State::Running;
        Ok(RunOutcome::Running { pid: info.pid, service_name, units: names })
    }

    /// Wait for every unit task to finish after cancellation.
    pub async fn wait(&mut self) {
        if self.state == State::Running {
            self.state = State::Draining;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(target: self.log_target.as_str(), "unit task failed: {e}");
            }
        }
        self.state = State::Stopped;
    }

    fn usable_units(&mut self, offsets: Option<&Offsets>) -> Vec<Box<dyn Tracer>> {
        let lt = self.log_target.as_str();
        for unit in &self.units {
            if let Some(function) = missing_required(unit.as_ref(), offsets) {
                debug!(target: lt, "{}: required function {function} not found, not loading", unit.name());
            }
        }
        filter_usable(std::mem::take(&mut self.units), offsets)
    }

    fn attach_all(
        &mut self,
        units: Vec<Box<dyn Tracer>>,
        info: &FileInfo,
        offsets: Option<&Offsets>,
    ) -> Result<Vec<Box<dyn Tracer>>, TracerError> {
        let mut attached: Vec<Box<dyn Tracer>> = Vec::with_capacity(units.len());
        for mut unit in units {
            if let Err(e) = self.attach_unit(unit.as_mut(), info, offsets) {
                error!(target: self.log_target.as_str(), "{e}");
                self.release(unit.as_mut());
                for done in attached.iter_mut().rev() {
                    self.release(done.as_mut());
                }
                return Err(e);
            }
            attached.push(unit);
        }
        Ok(attached)
    }

    fn attach_unit(
        &mut self,
        unit: &mut dyn Tracer,
        info: &FileInfo,
        offsets: Option<&Offsets>,
    ) -> Result<(), TracerError> {
        let name = unit.name();
        let lt = self.log_target.as_str();
        debug!(target: lt, "{name}: loading");

        let object = unit.load().map_err(|e| TracerError::unit(name, Phase::Load, e))?;
        let constants = unit.constants(info, offsets);
        object
            .check_constants(&constants)
            .map_err(|e| TracerError::unit(name, Phase::Constants, e))?;
        self.backend.create(unit, &object, &constants).map_err(|e| {
            print_verifier_error_info(&e);
            TracerError::unit(name, Phase::Create, e)
        })?;

        let mut instrumenter = Instrumenter::new(&mut self.backend, info, offsets, lt);
        let attach = |kind: HookKind| {
            move |e: anyhow::Error| {
                print_verifier_error_info(&e);
                TracerError::unit(name, Phase::Attach(kind), e)
            }
        };
        instrumenter.go_probes(unit).map_err(attach(HookKind::InProcess))?;
        instrumenter.kprobes(unit).map_err(attach(HookKind::Kernel))?;
        instrumenter.uprobes(unit).map_err(attach(HookKind::Module))?;
        instrumenter.socket_filters(unit).map_err(attach(HookKind::SocketFilter))?;
        Ok(())
    }

    fn release(&self, unit: &mut dyn Tracer) {
        if let Err(e) = unit.close() {
            warn!(target: self.log_target.as_str(), "{}: closing: {e:#}", unit.name());
        }
    }

    fn service_name(&self, info: &FileInfo) -> String {
        if let Some(name) = &self.config.service_name {
            name.clone()
        } else if self.config.system_wide {
            String::new()
        } else {
            info.executable_name().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Port;
    use crate::span::SpanKind;
    use crate::tracer::testing::{
        target_info, FakeBackend, FakeUnit, Journal, StaticFinder, StaticInspector,
    };
    use crate::tracer::FunctionPrograms;
    use tokio::sync::mpsc;

    fn span(path: &str) -> Span {
        Span {
            kind: SpanKind::HttpServer,
            method: "GET".into(),
            path: path.into(),
            status: 200,
            peer: "10.0.0.1".into(),
            host: "10.0.0.2".into(),
            host_port: 8080,
            content_length: 0,
            go_start_ns: 0,
            start_ns: 10,
            end_ns: 20,
            pid: 42,
            service_name: String::new(),
        }
    }

    fn by_name() -> TracerConfig {
        TracerConfig { exec_name: Some("app".into()), ..TracerConfig::default() }
    }

    fn http_unit() -> FakeUnit {
        FakeUnit::new("nethttp")
            .with_go_probe("serve", FunctionPrograms::required("uprobe_serve", Some("uprobe_serve_ret")))
            .with_go_probe("roundtrip", FunctionPrograms::optional("uprobe_roundtrip", None))
    }

    fn generic_unit() -> FakeUnit {
        FakeUnit::new("httpfltr")
            .with_kprobe("tcp_connect", FunctionPrograms::optional("kprobe_tcp_connect", None))
            .with_socket_filter("socket__http_filter")
    }

    fn tracer(
        config: TracerConfig,
        units: Vec<Box<dyn Tracer>>,
        finder: StaticFinder,
        inspector: StaticInspector,
        backend: FakeBackend,
    ) -> ProcessTracer<FakeBackend> {
        let locator = Locator::new(Box::new(finder), Box::new(inspector), "test");
        ProcessTracer::new(config, units, locator, backend, "test")
    }

    #[tokio::test]
    async fn test_happy_path_by_name() {
        let backend = FakeBackend::default();
        let calls = backend.calls_handle();
        let released = backend.released_handle();
        let units: Vec<Box<dyn Tracer>> =
            vec![Box::new(http_unit().emitting(vec![span("/ping")])), Box::new(generic_unit())];
        let mut tracer = tracer(
            by_name(),
            units,
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(Some(vec!["serve"])),
            backend,
        );

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let outcome = tracer.start(&cancel, &tx).unwrap();
        match outcome {
            RunOutcome::Running { pid, service_name, units } => {
                assert_eq!(pid, Pid(42));
                assert_eq!(service_name, "app");
                assert_eq!(units, vec!["nethttp", "httpfltr"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(tracer.state(), State::Running);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].path, "/ping");
        assert_eq!(batch[0].service_name, "app");

        cancel.cancel();
        tracer.wait().await;
        assert_eq!(tracer.state(), State::Stopped);

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "create:nethttp",
                "offset:nethttp:uprobe_serve@0x1000",
                "offset:nethttp:uprobe_serve_ret@0x1080",
                "create:httpfltr",
                "kprobe:httpfltr:kprobe_tcp_connect@tcp_connect",
                "socket:httpfltr:socket__http_filter",
            ]
        );
        // Every attached handle is released once the tasks are done
        assert_eq!(released.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_attach_releases_processed_units() {
        let journal = Journal::default();
        let backend = FakeBackend::failing_on("kprobe_b");
        let calls = backend.calls_handle();
        let released = backend.released_handle();
        let units: Vec<Box<dyn Tracer>> = vec![
            Box::new(generic_unit().with_journal(&journal)),
            Box::new(
                FakeUnit::new("b")
                    .with_socket_filter("socket_b")
                    .with_kprobe("tcp_sendmsg", FunctionPrograms::optional("kprobe_b", None))
                    .with_journal(&journal),
            ),
            Box::new(FakeUnit::new("c").with_journal(&journal)),
        ];
        let mut tracer = tracer(
            by_name(),
            units,
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            backend,
        );

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let err = tracer.start(&cancel, &tx).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Attach(HookKind::Kernel)));
        assert!(err.to_string().starts_with("b: attaching kernel probes"));
        assert_eq!(tracer.state(), State::Stopped);

        assert!(!calls.lock().unwrap().iter().any(|c| c == "create:c"));
        assert_eq!(*journal.lock().unwrap(), vec!["close:b", "close:httpfltr"]);
        assert_eq!(released.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_failure_reports_phase() {
        let backend = FakeBackend::failing_on("httpfltr");
        let mut tracer = tracer(
            by_name(),
            vec![Box::new(generic_unit())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            backend,
        );

        let (tx, _rx) = mpsc::channel(4);
        let err = tracer.start(&CancellationToken::new(), &tx).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Create));
    }

    #[tokio::test]
    async fn test_load_failure_reports_phase() {
        let mut tracer = tracer(
            by_name(),
            vec![Box::new(generic_unit().failing_load())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            FakeBackend::default(),
        );

        let (tx, _rx) = mpsc::channel(4);
        let err = tracer.start(&CancellationToken::new(), &tx).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Load));
        assert!(err.to_string().contains("httpfltr.bpf.o: no such file"));
    }

    #[tokio::test]
    async fn test_inspection_failure_keeps_generic_units() {
        let mut tracer = tracer(
            by_name(),
            vec![Box::new(http_unit()), Box::new(generic_unit())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            FakeBackend::default(),
        );

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let outcome = tracer.start(&cancel, &tx).unwrap();
        assert!(matches!(outcome, RunOutcome::Running { ref units, .. } if units == &vec!["httpfltr"]));
        cancel.cancel();
        tracer.wait().await;
    }

    #[tokio::test]
    async fn test_no_target() {
        let config = TracerConfig { port: Some(Port(9090)), ..TracerConfig::default() };
        let mut tracer = tracer(
            config,
            vec![Box::new(generic_unit())],
            StaticFinder(vec![]),
            StaticInspector(None),
            FakeBackend::default(),
        );

        let (tx, _rx) = mpsc::channel(4);
        let outcome = tracer.start(&CancellationToken::new(), &tx).unwrap();
        assert!(matches!(outcome, RunOutcome::NoTarget(DiscoveryError::NoSuitableProcess(Port(9090)))));
        assert_eq!(tracer.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_no_usable_unit() {
        let backend = FakeBackend::default();
        let calls = backend.calls_handle();
        let mut tracer = tracer(
            by_name(),
            vec![Box::new(http_unit())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(Some(vec!["roundtrip"])),
            backend,
        );

        let (tx, _rx) = mpsc::channel(4);
        let outcome = tracer.start(&CancellationToken::new(), &tx).unwrap();
        assert!(matches!(outcome, RunOutcome::NoInstrumentation { pid: Pid(42) }));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_service_name_override_and_system_wide() {
        let config = TracerConfig { service_name: Some("checkout".into()), ..by_name() };
        let mut tracer = tracer(
            config,
            vec![Box::new(generic_unit())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            FakeBackend::default(),
        );
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let outcome = tracer.start(&cancel, &tx).unwrap();
        assert!(matches!(outcome, RunOutcome::Running { ref service_name, .. } if service_name == "checkout"));
        cancel.cancel();
        tracer.wait().await;

        let config = TracerConfig { system_wide: true, ..by_name() };
        let mut tracer = tracer_system_wide(config);
        let cancel = CancellationToken::new();
        let outcome = tracer.start(&cancel, &tx).unwrap();
        assert!(matches!(outcome, RunOutcome::Running { ref service_name, .. } if service_name.is_empty()));
        cancel.cancel();
        tracer.wait().await;
    }

    fn tracer_system_wide(config: TracerConfig) -> ProcessTracer<FakeBackend> {
        tracer(
            config,
            vec![Box::new(generic_unit())],
            StaticFinder(vec![target_info(42, "app")]),
            StaticInspector(None),
            FakeBackend::default(),
        )
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut tracer = tracer_system_wide(by_name());
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        tracer.start(&cancel, &tx).unwrap();

        assert!(matches!(tracer.start(&cancel, &tx), Err(TracerError::AlreadyStarted)));
        cancel.cancel();
        tracer.wait().await;
    }
}
