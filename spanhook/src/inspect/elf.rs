//! Symbol-table based offset inspection.
//!
//! Looks the requested functions up in `.symtab` and `.dynsym`, matching
//! either the raw symbol name (Go and C symbols) or its demangled form
//! without hash (Rust symbols). Symbol addresses are converted to file
//! offsets, which is what uprobes attach to.
//!
//! On x86-64 the body of each function is decoded to collect the offsets of
//! its `ret` instructions. Return probes corrupt Go stacks that move, so
//! return handlers of Go functions are attached there instead. Other
//! architectures get no return offsets.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use object::{Architecture, Object, ObjectSection, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;

use super::{FuncOffsets, OffsetInspector, Offsets};
use crate::discovery::FileInfo;

/// [`OffsetInspector`] reading the ELF symbol tables of the target image.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolInspector;

impl OffsetInspector for SymbolInspector {
    fn inspect(&self, info: &FileInfo, functions: &[&str]) -> Result<Offsets> {
        let path = info.cmd_exe_path.display();
        let file = object::File::parse(info.image.data())
            .with_context(|| format!("Failed to parse executable {path}"))?;

        let offsets = resolve_functions(&file, functions);
        if offsets.is_empty() {
            bail!("none of the {} instrumentable functions found in {path}", functions.len());
        }
        Ok(offsets)
    }
}

/// Offsets of the `functions` present in the symbol tables of `file`.
#[must_use]
pub fn resolve_functions(file: &object::File<'_>, functions: &[&str]) -> Offsets {
    let wanted: HashSet<&str> = functions.iter().copied().collect();
    let mut funcs = HashMap::new();

    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        if symbol.kind() != SymbolKind::Text || symbol.is_undefined() {
            continue;
        }
        let Ok(raw) = symbol.name() else {
            continue;
        };

        let name = if wanted.contains(raw) {
            raw.to_string()
        } else {
            let demangled = format!("{:#}", demangle(raw));
            if !wanted.contains(demangled.as_str()) {
                continue;
            }
            demangled
        };
        if funcs.contains_key(&name) {
            continue;
        }

        let Some(offsets) = function_offsets(file, &symbol) else {
            continue;
        };
        funcs.insert(name, offsets);
    }

    Offsets { funcs }
}

/// Translate a symbol's virtual address into an offset inside the file,
/// and collect the return instructions of its body.
fn function_offsets(file: &object::File<'_>, symbol: &object::Symbol<'_, '_>) -> Option<FuncOffsets> {
    let section = file.section_by_index(symbol.section_index()?).ok()?;
    let (file_start, _) = section.file_range()?;
    let delta = symbol.address().checked_sub(section.address())?;
    let start = file_start + delta;

    let returns = if file.architecture() == Architecture::X86_64 {
        section
            .data()
            .ok()
            .and_then(|data| {
                let begin = usize::try_from(delta).ok()?;
                let end = begin.checked_add(usize::try_from(symbol.size()).ok()?)?;
                data.get(begin..end)
            })
            .map(|code| return_offsets(code, start))
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    Some(FuncOffsets { start, returns })
}

/// Offsets of the `ret` instructions in x86-64 `code` located at file
/// offset `start`.
#[must_use]
pub fn return_offsets(code: &[u8], start: u64) -> Vec<u64> {
    let mut decoder = Decoder::with_ip(64, code, start, DecoderOptions::NONE);
    let mut returns = Vec::new();
    for instruction in &mut decoder {
        if instruction.mnemonic() == Mnemonic::Ret {
            returns.push(instruction.ip());
        }
    }
    returns
}
