//! # eBPF Loading and Attachment
//!
//! aya implementation of [`Backend`].
//!
//! ## Attachment Points
//!
//! - **Uprobe** at a file offset: in-process hooks, every process running the executable
//! - **Uprobe** at a symbol: module hooks, target pid only
//! - **Kprobe**: kernel function hooks
//! - **Socket filter**: raw `AF_PACKET` socket receiving every frame
//!
//! Links are taken out of the program so that their lifetime is owned by
//! the unit's closers rather than by the [`Ebpf`] collection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aya::programs::{KProbe, SocketFilter, UProbe};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{debug, info};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

use super::closer::{LinkCloser, SocketCloser};
use super::{Backend, Closer, ConstValue, Constants, ProgramObject, Tracer};
use crate::domain::Pid;

/// Backend loading units into the running kernel.
#[derive(Debug, Default)]
pub struct AyaBackend {
    pin_path: Option<PathBuf>,
}

impl AyaBackend {
    /// Maps declared as pinned are shared through `pin_path` (a bpffs mount).
    #[must_use]
    pub fn new(pin_path: Option<PathBuf>) -> Self {
        Self { pin_path }
    }
}

/// Initialize eBPF logger
fn init_ebpf_logger(unit: &str, bpf: &mut Ebpf) {
    // Objects built without aya-log have no log map
    if let Err(e) = EbpfLogger::init(bpf) {
        debug!("{unit}: eBPF logger not initialized: {e}");
    }
}

fn objects<'u>(unit: &'u mut dyn Tracer) -> Result<&'u mut Ebpf> {
    let name = unit.name();
    unit.objects().with_context(|| format!("{name}: BPF objects not loaded"))
}

impl Backend for AyaBackend {
    fn create(&mut self, unit: &mut dyn Tracer, object: &ProgramObject, constants: &Constants) -> Result<()> {
        let mut loader = EbpfLoader::new();
        if let Some(pin_path) = &self.pin_path {
            loader.map_pin_path(pin_path);
        }
        for (name, value) in constants {
            debug!("{}: constant {name} = {value}", unit.name());
            match value {
                ConstValue::U8(v) => loader.set_global(name, v, true),
                ConstValue::U32(v) => loader.set_global(name, v, true),
                ConstValue::U64(v) => loader.set_global(name, v, true),
            };
        }

        let mut ebpf = loader
            .load(object.bytes())
            .with_context(|| format!("loading {}", object.source()))?;
        init_ebpf_logger(unit.name(), &mut ebpf);
        unit.assign(ebpf);
        Ok(())
    }

    fn attach_offset(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        target: &Path,
        offset: u64,
    ) -> Result<Box<dyn Closer>> {
        let prog: &mut UProbe = objects(unit)?
            .program_mut(program)
            .with_context(|| format!("{program} program not found"))?
            .try_into()?;
        if prog.fd().is_err() {
            prog.load()?;
        }
        let link_id = prog.attach(None, offset, target, None)?;
        let link = prog.take_link(link_id)?;
        info!("✓ Attached uprobe: {program} at {}+{offset:#x}", target.display());
        Ok(Box::new(LinkCloser::new(format!("uprobe {program}@{offset:#x}"), link)))
    }

    fn attach_symbol(
        &mut self,
        unit: &mut dyn Tracer,
        program: &str,
        target: &Path,
        symbol: &str,
        pid: Pid,
    ) -> Result<Box<dyn Closer>> {
        let prog: &mut UProbe = objects(unit)?
            .program_mut(program)
            .with_context(|| format!("{program} program not found"))?
            .try_into()?;
        if prog.fd().is_err() {
            prog.load()?;
        }
        let link_id = prog.attach(Some(symbol), 0, target, Some(pid.0))?;
        let link = prog.take_link(link_id)?;
        info!("✓ Attached uprobe: {program} at {symbol} ({pid})");
        Ok(Box::new(LinkCloser::new(format!("uprobe {program}@{symbol}"), link)))
    }

    fn attach_kprobe(&mut self, unit: &mut dyn Tracer, program: &str, function: &str) -> Result<Box<dyn Closer>> {
        let prog: &mut KProbe = objects(unit)?
            .program_mut(program)
            .with_context(|| format!("{program} program not found"))?
            .try_into()?;
        if prog.fd().is_err() {
            prog.load()?;
        }
        let link_id = prog.attach(function, 0)?;
        let link = prog.take_link(link_id)?;
        info!("✓ Attached kprobe: {program} at {function}");
        Ok(Box::new(LinkCloser::new(format!("kprobe {program}@{function}"), link)))
    }

    fn attach_socket_filter(&mut self, unit: &mut dyn Tracer, program: &str) -> Result<Box<dyn Closer>> {
        let prog: &mut SocketFilter = objects(unit)?
            .program_mut(program)
            .with_context(|| format!("{program} program not found"))?
            .try_into()?;
        if prog.fd().is_err() {
            prog.load()?;
        }

        let sock = socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )
        .context("opening raw packet socket")?;
        prog.attach(&sock)?;
        info!("✓ Attached socket filter: {program}");
        Ok(Box::new(SocketCloser::new(format!("socket filter {program}"), sock)))
    }
}
