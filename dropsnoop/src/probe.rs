//! Loading, configuring and attaching the `kfree_skb` probe.

use anyhow::{anyhow, Context};
use std::path::Path;

use aya::maps::{Array, MapData, RingBuf};
use aya::programs::TracePoint;
use aya::{Ebpf, EbpfLoader};

use dropsnoop_common::{NamespaceProbe, FALLBACK_NS_SLOT, FILTER_NS_SLOT};

const PROGRAM: &str = "kfree_skb";
const TRACEPOINT_CATEGORY: &str = "skb";
const TRACEPOINT_NAME: &str = "kfree_skb";

/// Values written to the probe's `PARAMS` table before it is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    /// Reported for every drop when namespaces cannot be read from the skb.
    pub fallback_ns: u32,
    /// Only drops in this namespace are reported; 0 reports all.
    pub filter_ns: u32,
}

impl Params {
    /// `(slot, value)` pairs in the order they are written.
    pub fn slots(&self) -> [(u32, u64); 2] {
        [
            (FALLBACK_NS_SLOT, self.fallback_ns as u64),
            (FILTER_NS_SLOT, self.filter_ns as u64),
        ]
    }
}

/// A loaded and attached probe. Dropping it detaches the program.
pub struct DropProbe {
    bpf: Ebpf,
}

impl DropProbe {
    /// Loads `object`, fills `PARAMS`, then attaches to `skb/kfree_skb`.
    ///
    /// The table is written before attaching so the probe never observes a
    /// drop with an unconfigured filter.
    pub fn attach(object: &Path, ns_probe: NamespaceProbe, params: Params) -> anyhow::Result<Self> {
        raise_memlock_rlimit();

        let mut bpf = EbpfLoader::new()
            .set_global("NS_PROBE", &ns_probe, true)
            .load_file(object)
            .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            tracing::warn!("failed to initialize eBPF logger: {}", e);
        }

        write_params(&mut bpf, params)?;

        let program: &mut TracePoint = bpf
            .program_mut(PROGRAM)
            .ok_or_else(|| anyhow!("{} program not found in eBPF object", PROGRAM))?
            .try_into()?;
        program.load().context("verifier rejected the probe")?;
        program
            .attach(TRACEPOINT_CATEGORY, TRACEPOINT_NAME)
            .with_context(|| {
                format!(
                    "failed to attach to {}/{} tracepoint",
                    TRACEPOINT_CATEGORY, TRACEPOINT_NAME
                )
            })?;
        tracing::info!(
            "eBPF probe attached to tracepoint {}/{}",
            TRACEPOINT_CATEGORY,
            TRACEPOINT_NAME
        );

        Ok(Self { bpf })
    }

    /// Takes ownership of the `EVENTS` ring buffer for polling.
    pub fn events(&mut self) -> anyhow::Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map("EVENTS")
            .ok_or_else(|| anyhow!("EVENTS map not found in eBPF object"))?;
        RingBuf::try_from(map).context("failed to open EVENTS ring buffer")
    }
}

fn write_params(bpf: &mut Ebpf, params: Params) -> anyhow::Result<()> {
    let map = bpf
        .map_mut("PARAMS")
        .ok_or_else(|| anyhow!("PARAMS map not found in eBPF object"))?;
    let mut table: Array<_, u64> = Array::try_from(map)?;
    for (slot, value) in params.slots() {
        table
            .set(slot, value, 0)
            .with_context(|| format!("failed to write PARAMS[{}]", slot))?;
    }
    tracing::debug!(
        "PARAMS: fallback_ns={} filter_ns={}",
        params.fallback_ns,
        params.filter_ns
    );
    Ok(())
}

/// Kernels before 5.11 charge BPF maps against RLIMIT_MEMLOCK.
fn raise_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::debug!("remove limit on locked memory failed, ret is: {}", ret);
    }
}
