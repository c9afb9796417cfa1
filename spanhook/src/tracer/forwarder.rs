//! # Span Forwarding
//!
//! Reads the `events` ring buffer of a unit, decodes every record into a
//! [`Span`] and forwards them in batches. A batch leaves when it is full or
//! when the batch timeout elapses, whichever comes first.
//!
//! Backpressure from the shared channel only stalls this unit; the kernel
//! side keeps writing and drops records once its ring buffer is full.

use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::{MapData, RingBuf};
use log::debug;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc::Sender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::span::Span;

/// Batching parameters of one unit.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub length: usize,
    pub timeout: Duration,
}

/// Accumulates spans into batches of a fixed maximum length.
#[derive(Debug)]
pub struct Batcher {
    pending: Vec<Span>,
    length: usize,
}

impl Batcher {
    #[must_use]
    pub fn new(length: usize) -> Self {
        let length = length.max(1);
        Self { pending: Vec::with_capacity(length), length }
    }

    /// Add a span; returns the batch once it is full.
    pub fn push(&mut self, span: Span) -> Option<Vec<Span>> {
        self.pending.push(span);
        if self.pending.len() >= self.length {
            self.take()
        } else {
            None
        }
    }

    /// Whatever is pending, if anything.
    pub fn take(&mut self) -> Option<Vec<Span>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::replace(&mut self.pending, Vec::with_capacity(self.length)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Forward spans from `ring_buf` to `out` until `cancel` fires or the
/// receiving side goes away.
///
/// # Errors
/// Returns an error if the ring buffer cannot be polled.
pub async fn forward_events(
    ring_buf: RingBuf<MapData>,
    batch: BatchConfig,
    service_name: &str,
    cancel: &CancellationToken,
    out: &Sender<Vec<Span>>,
    log_target: &str,
) -> Result<()> {
    // SAFETY: the ring buffer owns its map fd, which stays open and unchanged
    // until the AsyncFd drops it
    #[allow(unsafe_code)]
    let registered = unsafe { AsyncFd::register_with_interest(ring_buf, Interest::READABLE) };
    let mut async_fd = registered.map_err(std::io::Error::from).context("registering ring buffer")?;
    let mut batcher = Batcher::new(batch.length);
    let mut ticker = tokio::time::interval(batch.timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let mut ready = Vec::new();
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => ready.extend(batcher.take()),
            guard = async_fd.readable_mut() => {
                let mut guard = guard.context("polling ring buffer")?;
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    match Span::decode(&item, service_name) {
                        Ok(span) => ready.extend(batcher.push(span)),
                        Err(e) => debug!(target: log_target, "dropping record: {e:#}"),
                    }
                }
                guard.clear_ready();
            }
        }

        for spans in ready {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                sent = out.send(spans) => if sent.is_err() {
                    debug!(target: log_target, "span receiver closed, stopping");
                    return Ok(());
                },
            }
        }
    }

    if let Some(rest) = batcher.take() {
        if out.try_send(rest).is_err() {
            debug!(target: log_target, "dropping last batch on shutdown");
        }
    }
    Ok(())
}
