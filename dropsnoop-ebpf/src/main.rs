#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_void,
    helpers::{bpf_probe_read_kernel, gen::bpf_get_stack},
    macros::{map, tracepoint},
    maps::{Array, RingBuf},
    programs::TracePointContext,
    EbpfContext,
};
use aya_log_ebpf::error;
use dropsnoop_common::{
    pipeline::{
        run_pipeline, ConfigTable, EventSink, KernelReader, Outcome, StackSource, SuppressReason,
    },
    DropEvent, NamespaceProbe, FILTER_NS_SLOT, MAX_STACK, MAX_STACK_BYTES, PARAMS_LEN,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// Offset of `skbaddr` in `trace_event_raw_kfree_skb`, after the 8-byte
/// common tracepoint header.
const SKBADDR_OFFSET: usize = 8;

/// Ring buffer size in bytes, about 1500 events.
const RING_BUF_SIZE: u32 = 256 * 1024;

/// Filled in by the loader with `EbpfLoader::set_global` before load. The
/// map backing it is frozen, so the verifier prunes the unused strategy.
#[no_mangle]
pub static NS_PROBE: NamespaceProbe = NamespaceProbe::FALLBACK;

#[map]
static PARAMS: Array<u64> = Array::with_max_entries(PARAMS_LEN, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

struct Params;

impl ConfigTable for Params {
    #[inline(always)]
    fn slot(&self, index: u32) -> Option<u64> {
        PARAMS.get(index).copied()
    }
}

struct Kernel;

impl KernelReader for Kernel {
    #[inline(always)]
    fn read_u64(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_kernel(addr as *const u64) }.ok()
    }

    #[inline(always)]
    fn read_u32(&self, addr: u64) -> Option<u32> {
        unsafe { bpf_probe_read_kernel(addr as *const u32) }.ok()
    }
}

struct KernelStack<'a>(&'a TracePointContext);

impl StackSource for KernelStack<'_> {
    #[inline(always)]
    fn capture(&self, buf: &mut [u64; MAX_STACK]) -> i64 {
        // flags 0: kernel stack, no skipped frames
        unsafe {
            bpf_get_stack(
                self.0.as_ptr(),
                buf.as_mut_ptr() as *mut c_void,
                MAX_STACK_BYTES,
                0,
            )
        }
    }
}

struct Events;

impl EventSink for Events {
    #[inline(always)]
    fn try_emit(&self, event: &DropEvent) -> bool {
        EVENTS.output(event, 0).is_ok()
    }
}

#[tracepoint]
pub fn kfree_skb(ctx: TracePointContext) -> u32 {
    let skb: u64 = unsafe { ctx.read_at(SKBADDR_OFFSET) }.unwrap_or(0);
    let probe = unsafe { core::ptr::read_volatile(&NS_PROBE) };

    let outcome = run_pipeline(
        probe.strategy(),
        skb,
        &Kernel,
        &Params,
        &KernelStack(&ctx),
        &Events,
    );

    if outcome == Outcome::Suppressed(SuppressReason::MissingFilterSlot) {
        error!(&ctx, "config slot {} missing, drop suppressed", FILTER_NS_SLOT);
    }

    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
