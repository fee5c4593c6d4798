//! Per-drop processing: resolve namespace, filter, capture stack, emit.
//!
//! Everything here is bounded and allocation free so the probe can call it
//! inline from the tracepoint. Kernel helpers are reached through the traits
//! below; the probe binds them to `bpf_probe_read_kernel`, the `PARAMS`
//! array, `bpf_get_stack` and the `EVENTS` ring buffer.

use crate::{
    DropEvent, FieldOffsets, NamespaceStrategy, FALLBACK_NS_SLOT, FILTER_NS_SLOT, MAX_STACK,
    MAX_STACK_BYTES,
};

/// Read-only view of the two-slot config table.
pub trait ConfigTable {
    fn slot(&self, index: u32) -> Option<u64>;
}

/// Fault-tolerant reads of kernel memory.
pub trait KernelReader {
    fn read_u64(&self, addr: u64) -> Option<u64>;
    fn read_u32(&self, addr: u64) -> Option<u32>;
}

/// Source of the current kernel call stack.
pub trait StackSource {
    /// Fills `buf` with return addresses, most recent first, and returns the
    /// number of bytes written or a negative errno.
    fn capture(&self, buf: &mut [u64; MAX_STACK]) -> i64;
}

/// Non-blocking output channel.
pub trait EventSink {
    /// Returns `false` when the event could not be queued.
    fn try_emit(&self, event: &DropEvent) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuppressReason {
    /// `FILTER_NS_SLOT` could not be looked up.
    MissingFilterSlot,
    NamespaceMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Suppress(SuppressReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Emitted,
    /// The sink was full; the event is lost.
    Dropped,
    Suppressed(SuppressReason),
}

/// Resolves the namespace id that owns `skb`. Returns 0 when unknown.
#[inline(always)]
pub fn resolve_namespace<R, C>(strategy: NamespaceStrategy, skb: u64, reader: &R, config: &C) -> u32
where
    R: KernelReader,
    C: ConfigTable,
{
    match strategy {
        NamespaceStrategy::Direct(offsets) => read_namespace(reader, skb, offsets).unwrap_or(0),
        NamespaceStrategy::Fallback => config
            .slot(FALLBACK_NS_SLOT)
            .map(|value| value as u32)
            .unwrap_or(0),
    }
}

#[inline(always)]
fn read_namespace<R: KernelReader>(reader: &R, skb: u64, offsets: FieldOffsets) -> Option<u32> {
    if skb == 0 {
        return None;
    }
    let dev = reader.read_u64(skb.wrapping_add(offsets.skb_dev as u64))?;
    if dev == 0 {
        return None;
    }
    let net = reader.read_u64(dev.wrapping_add(offsets.dev_nd_net as u64))?;
    if net == 0 {
        return None;
    }
    reader.read_u32(net.wrapping_add(offsets.net_ns_inum as u64))
}

/// Decides whether a drop in `namespace_id` should be reported.
///
/// A filter value of 0 means "no filtering". A missing filter slot is a
/// loader bug and suppresses everything rather than guessing.
#[inline(always)]
pub fn filter<C: ConfigTable>(config: &C, namespace_id: u32) -> Verdict {
    let Some(wanted) = config.slot(FILTER_NS_SLOT) else {
        return Verdict::Suppress(SuppressReason::MissingFilterSlot);
    };
    if wanted == 0 || wanted == namespace_id as u64 {
        Verdict::Pass
    } else {
        Verdict::Suppress(SuppressReason::NamespaceMismatch)
    }
}

/// Captures into `buf` and returns the number of valid bytes, a multiple of
/// 8 no larger than [`MAX_STACK_BYTES`]. `buf` must be zeroed by the caller.
#[inline(always)]
pub fn capture_stack<S: StackSource>(source: &S, buf: &mut [u64; MAX_STACK]) -> u32 {
    let written = source.capture(buf);
    if written <= 0 {
        return 0;
    }
    let written = if written > MAX_STACK_BYTES as i64 {
        MAX_STACK_BYTES
    } else {
        written as u32
    };
    written & !7
}

/// Runs the full per-drop pipeline for one tracepoint hit.
#[inline(always)]
pub fn run_pipeline<R, C, S, E>(
    strategy: NamespaceStrategy,
    skb: u64,
    reader: &R,
    config: &C,
    stack: &S,
    sink: &E,
) -> Outcome
where
    R: KernelReader,
    C: ConfigTable,
    S: StackSource,
    E: EventSink,
{
    let namespace_id = resolve_namespace(strategy, skb, reader, config);
    if let Verdict::Suppress(reason) = filter(config, namespace_id) {
        return Outcome::Suppressed(reason);
    }

    let mut event = DropEvent::new(namespace_id);
    event.stack_size = capture_stack(stack, &mut event.stack);

    if sink.try_emit(&event) {
        Outcome::Emitted
    } else {
        Outcome::Dropped
    }
}
