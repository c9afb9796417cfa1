//! Loadable eBPF objects and the constants patched into them.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use object::{Architecture, Object, ObjectSymbol};

/// Value written into a read-only global of the object before load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    U8(u8),
    U32(u32),
    U64(u64),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::U8(v) => write!(f, "{v}u8"),
            ConstValue::U32(v) => write!(f, "{v}u32"),
            ConstValue::U64(v) => write!(f, "{v}u64"),
        }
    }
}

/// Constant name -> value, ordered for stable logs.
pub type Constants = BTreeMap<&'static str, ConstValue>;

/// Compiled eBPF object of one unit, validated but not yet in the kernel.
pub struct ProgramObject {
    source: String,
    bytes: Vec<u8>,
    symbols: HashSet<String>,
}

impl ProgramObject {
    /// Read and validate the object at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not an eBPF ELF.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_bytes(path.display().to_string(), bytes)
    }

    /// Validate an in-memory object.
    ///
    /// # Errors
    /// Returns an error if `bytes` is not an ELF object for the BPF target.
    pub fn from_bytes(source: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let source = source.into();
        let symbols = {
            let file = object::File::parse(&*bytes)
                .with_context(|| format!("{source} is not a valid object file"))?;
            if file.architecture() != Architecture::Bpf {
                bail!("{source} is not an eBPF object (architecture {:?})", file.architecture());
            }
            file.symbols()
                .filter_map(|s| s.name().ok().filter(|n| !n.is_empty()).map(ToString::to_string))
                .collect()
        };
        Ok(Self { source, bytes, symbols })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols.contains(name)
    }

    /// Every constant must name a global of the object.
    ///
    /// # Errors
    /// Returns an error naming the first unknown constant.
    pub fn check_constants(&self, constants: &Constants) -> Result<()> {
        for name in constants.keys() {
            if !self.has_symbol(name) {
                bail!("constant {name} not found in {}", self.source);
            }
        }
        Ok(())
    }

    /// Object with the given symbols and no code, for orchestration tests.
    #[cfg(test)]
    pub(crate) fn fake(source: &str, symbols: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            bytes: Vec::new(),
            symbols: symbols.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Debug for ProgramObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramObject")
            .field("source", &self.source)
            .field("bytes", &self.bytes.len())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}
