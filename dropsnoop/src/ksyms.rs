use anyhow::Context;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One `/proc/kallsyms` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub addr: u64,
    pub name: String,
    /// Owning module, `None` for the core kernel image.
    pub module: Option<String>,
}

/// Kernel symbols sorted by address, for mapping stack addresses back to
/// `function+offset`.
#[derive(Debug, Default)]
pub struct SymbolCache {
    syms: Vec<Symbol>,
}

impl SymbolCache {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("could not open {}", path.display()))?;
        let cache = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("could not read {}", path.display()))?;

        if !cache.is_empty() && cache.syms.iter().all(|s| s.addr == 0) {
            tracing::warn!(
                "All symbol addresses in {} are zero (kptr_restrict?); stacks will not resolve",
                path.display()
            );
        }
        tracing::debug!("Loaded {} kernel symbols", cache.len());
        Ok(cache)
    }

    /// Parses `address type name [module]` lines. Lines with fewer than
    /// three fields or an unparsable address are skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> std::io::Result<Self> {
        let mut syms = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(_kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            let module = fields
                .next()
                .map(|m| m.trim_start_matches('[').trim_end_matches(']').to_string());
            syms.push(Symbol {
                addr,
                name: name.to_string(),
                module,
            });
        }
        syms.sort_by_key(|s| s.addr);
        Ok(Self { syms })
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Finds the symbol with the largest address `<= addr` and the offset of
    /// `addr` into it.
    pub fn resolve(&self, addr: u64) -> Option<(&Symbol, u64)> {
        let idx = self.syms.partition_point(|s| s.addr <= addr);
        let sym = self.syms.get(idx.checked_sub(1)?)?;
        Some((sym, addr - sym.addr))
    }
}
