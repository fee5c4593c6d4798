use serde::Serialize;
use std::fmt::Write as _;

use dropsnoop_common::DropEvent;

use crate::ksyms::SymbolCache;

/// A stack frame mapped back to a kernel symbol when possible.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Frame {
    pub addr: u64,
    pub symbol: Option<String>,
    pub offset: Option<u64>,
    pub module: Option<String>,
}

/// Userspace view of a [`DropEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct DropReport {
    /// Receive time in ms since the epoch; the probe does not timestamp.
    pub timestamp: i64,
    pub namespace_id: u32,
    pub frames: Vec<Frame>,
}

/// Reads one ring buffer item. Short items are rejected.
pub fn decode(item: &[u8]) -> Option<DropEvent> {
    if item.len() < DropEvent::LEN {
        return None;
    }
    Some(unsafe { core::ptr::read_unaligned(item.as_ptr() as *const DropEvent) })
}

impl DropReport {
    /// Only the `stack_size / 8` valid entries are symbolized.
    pub fn from_ebpf(event: &DropEvent, symbols: &SymbolCache) -> Self {
        let frames = event
            .frames()
            .iter()
            .map(|&addr| match symbols.resolve(addr) {
                Some((sym, offset)) => Frame {
                    addr,
                    symbol: Some(sym.name.clone()),
                    offset: Some(offset),
                    module: sym.module.clone(),
                },
                None => Frame {
                    addr,
                    symbol: None,
                    offset: None,
                    module: None,
                },
            })
            .collect();

        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            namespace_id: event.namespace_id,
            frames,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for frame in &self.frames {
            let _ = match (&frame.symbol, frame.offset) {
                (Some(name), Some(offset)) => match frame.module {
                    Some(ref module) => writeln!(
                        out,
                        "\t{} {}+{:#x} [{}]",
                        self.namespace_id, name, offset, module
                    ),
                    None => writeln!(out, "\t{} {}+{:#x}", self.namespace_id, name, offset),
                },
                _ => writeln!(out, "\t{} {:#x} <unresolved>", self.namespace_id, frame.addr),
            };
        }
        out.push_str("=======");
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
