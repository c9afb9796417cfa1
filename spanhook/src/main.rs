//! # spanhook - Main Entry Point
//!
//! Parses the arguments, runs the pre-flight checks, then drives one
//! [`ProcessTracer`] run and prints every span as a JSON line on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use spanhook::cli::Args;
use spanhook::discovery::locator::Locator;
use spanhook::discovery::ProcFinder;
use spanhook::domain::TracerError;
use spanhook::inspect::SymbolInspector;
use spanhook::preflight::run_preflight_checks;
use spanhook::span::{Span, SpanStats};
use spanhook::tracer::{AyaBackend, ProcessTracer, RunOutcome};
use spanhook::units::build_units;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Target all core components log through
const LOG_TARGET: &str = "spanhook::tracer";

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(TracerError::InvalidConfig(_)) = err.downcast_ref::<TracerError>() {
        return EXIT_USAGE;
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let config = args.to_config();
    config.validate()?;

    run_preflight_checks(config.bpf_pin_path.as_deref())?;

    if !quiet {
        eprintln!("spanhook v{}", env!("CARGO_PKG_VERSION"));
        match (&config.exec_name, config.port) {
            (Some(name), _) => eprintln!("target: {name}"),
            (None, Some(port)) => eprintln!("port: {port}"),
            (None, None) => {}
        }
    }

    let units = build_units(&config, LOG_TARGET)?;
    let locator = Locator::new(Box::new(ProcFinder::default()), Box::new(SymbolInspector), LOG_TARGET);
    let backend = AyaBackend::new(config.bpf_pin_path.clone());
    let (tx, mut rx) = mpsc::channel::<Vec<Span>>(config.channel_capacity);
    let mut tracer = ProcessTracer::new(config, units, locator, backend, LOG_TARGET);

    let cancel = CancellationToken::new();
    match tracer.start(&cancel, &tx)? {
        RunOutcome::NoTarget(e) => {
            warn!("nothing to instrument: {e}");
            return Ok(());
        }
        RunOutcome::NoInstrumentation { pid } => {
            warn!("no instrumentation available for {pid}");
            return Ok(());
        }
        RunOutcome::Running { pid, service_name, units } => {
            if !quiet {
                eprintln!("pid: {}", pid.0);
                eprintln!("service: {service_name}");
                eprintln!("units: {}", units.join(", "));
            }
        }
    }
    // Only the unit tasks hold senders now: the channel closes when they stop
    drop(tx);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let started = Instant::now();
    let deadline = tokio::time::sleep(args.duration_limit().unwrap_or(Duration::MAX));
    tokio::pin!(deadline);

    let mut stdout = std::io::stdout().lock();
    let mut stats = SpanStats::default();
    let mut exit_reason = "interrupted";

    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else {
                    exit_reason = "all units stopped";
                    break;
                };
                write_batch(&mut stdout, &batch, &mut stats)?;
                stdout.flush().context("Failed to flush spans")?;
            }
            () = &mut deadline => {
                exit_reason = "duration limit reached";
                break;
            }
            _ = &mut ctrl_c => break,
        }
    }

    info!("stopping: {exit_reason}");
    cancel.cancel();
    tracer.wait().await;

    // Spans flushed by the units on shutdown
    while let Ok(batch) = rx.try_recv() {
        write_batch(&mut stdout, &batch, &mut stats)?;
    }
    stdout.flush().context("Failed to flush spans")?;

    if !quiet {
        eprintln!(
            "\n{exit_reason}: {:.1}s, {} spans, mean {:.2}ms",
            started.elapsed().as_secs_f64(),
            stats.count,
            stats.mean_ms()
        );
    }
    Ok(())
}

/// Print one JSON line per span.
fn write_batch(out: &mut impl Write, batch: &[Span], stats: &mut SpanStats) -> Result<()> {
    for span in batch {
        serde_json::to_writer(&mut *out, span).context("Failed to write span")?;
        writeln!(out).context("Failed to write span")?;
        stats.record(span);
    }
    Ok(())
}
