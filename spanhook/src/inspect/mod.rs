//! # Binary Inspection
//!
//! Resolves instrumentable function names to code offsets inside the
//! target's executable image.
//!
//! ## Components
//!
//! - [`OffsetInspector`] - Seam consumed by the locator; failures are never fatal
//! - [`SymbolInspector`] - Default implementation backed by the ELF symbol table
//! - [`memory_maps`] - Shared module lookup through `/proc/<pid>/maps`
//!
//! The returned [`Offsets`] only contains the functions that were actually
//! found. Presence of an entry is what decides whether a unit with required
//! in-process hooks can run.

pub mod elf;
pub mod memory_maps;

use std::collections::HashMap;

use anyhow::Result;

use crate::discovery::FileInfo;

pub use elf::SymbolInspector;

/// Namespace of the Go runtime. A binary exposing only functions from this
/// namespace does not implement any request handling on its own.
pub const RUNTIME_PREFIX: &str = "runtime.";

/// Code locations of one function, as file offsets inside the executable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncOffsets {
    /// Entry of the function
    pub start: u64,
    /// Every return instruction, empty when unknown
    pub returns: Vec<u64>,
}

/// Function name -> resolved offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Offsets {
    pub funcs: HashMap<String, FuncOffsets>,
}

impl Offsets {
    #[must_use]
    pub fn get(&self, function: &str) -> Option<&FuncOffsets> {
        self.funcs.get(function)
    }

    #[must_use]
    pub fn contains(&self, function: &str) -> bool {
        self.funcs.contains_key(function)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// True when at least one resolved function lives outside the Go runtime.
    #[must_use]
    pub fn has_application_functions(&self) -> bool {
        self.funcs.keys().any(|name| !name.starts_with(RUNTIME_PREFIX))
    }
}

impl FromIterator<(String, FuncOffsets)> for Offsets {
    fn from_iter<T: IntoIterator<Item = (String, FuncOffsets)>>(iter: T) -> Self {
        Self { funcs: iter.into_iter().collect() }
    }
}

/// Resolves function offsets in a discovered executable.
pub trait OffsetInspector: Send {
    /// Look up `functions` in the image owned by `info`.
    ///
    /// # Errors
    /// Returns an error when the image cannot be parsed or none of the
    /// functions is present. Callers degrade to generic instrumentation.
    fn inspect(&self, info: &FileInfo, functions: &[&str]) -> Result<Offsets>;
}
