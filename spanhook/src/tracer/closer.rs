//! Attachment handles and their release.
//!
//! Every handle created while attaching a unit (probe links, sockets) is
//! wrapped in a [`Closer`] and registered on the unit right away. Release
//! happens in reverse acquisition order and keeps going when a handle fails,
//! so a single failing detach never leaks the others.

use std::fmt;
use std::os::fd::OwnedFd;

use anyhow::{Context, Result};
use aya::programs::links::Link;
use log::warn;

/// An OS resource owned by one instrumentation unit.
pub trait Closer: Send {
    /// Short description used in error messages
    fn describe(&self) -> String;

    /// Release the resource.
    ///
    /// # Errors
    /// Returns an error when the kernel refuses the release.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Owned probe or filter link, detached on close.
pub struct LinkCloser<L> {
    label: String,
    link: L,
}

impl<L: Link + Send> LinkCloser<L> {
    pub fn new(label: impl Into<String>, link: L) -> Self {
        Self { label: label.into(), link }
    }
}

impl<L: Link + Send> Closer for LinkCloser<L> {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn close(self: Box<Self>) -> Result<()> {
        let Self { label, link } = *self;
        link.detach().with_context(|| format!("detaching {label}"))
    }
}

/// Socket a filter program is attached to. Closing the socket removes the
/// filter with it.
pub struct SocketCloser {
    label: String,
    fd: OwnedFd,
}

impl SocketCloser {
    pub fn new(label: impl Into<String>, fd: OwnedFd) -> Self {
        Self { label: label.into(), fd }
    }
}

impl Closer for SocketCloser {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn close(self: Box<Self>) -> Result<()> {
        let Self { fd, .. } = *self;
        drop(fd);
        Ok(())
    }
}

/// Handles acquired by one unit, released last-in first-out.
#[derive(Default)]
pub struct Closers {
    handles: Vec<Box<dyn Closer>>,
}

impl Closers {
    pub fn push(&mut self, closer: Box<dyn Closer>) {
        self.handles.push(closer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Release every handle, even after a failure.
    ///
    /// # Errors
    /// Returns the first release error; later errors are logged.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(closer) = self.handles.pop() {
            let name = closer.describe();
            if let Err(e) = closer.close() {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("releasing {name}: {e:#}");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Closers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handles.iter().map(|h| h.describe())).finish()
    }
}

impl Drop for Closers {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!("releasing attachment handles: {e:#}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::bail;
    use std::sync::{Arc, Mutex};

    /// Records its release into a shared journal; optionally fails.
    pub struct RecordingCloser {
        pub name: String,
        pub fail: bool,
        pub journal: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingCloser {
        pub fn boxed(name: &str, fail: bool, journal: &Arc<Mutex<Vec<String>>>) -> Box<dyn Closer> {
            Box::new(Self { name: name.to_string(), fail, journal: Arc::clone(journal) })
        }
    }

    impl Closer for RecordingCloser {
        fn describe(&self) -> String {
            self.name.clone()
        }

        fn close(self: Box<Self>) -> Result<()> {
            self.journal.lock().unwrap().push(self.name.clone());
            if self.fail {
                bail!("{} refused to close", self.name);
            }
            Ok(())
        }
    }
}
