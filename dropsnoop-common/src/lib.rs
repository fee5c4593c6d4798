#![no_std]

pub mod pipeline;

/// Maximum number of kernel return addresses captured per drop.
pub const MAX_STACK: usize = 20;

/// Capacity of [`DropEvent::stack`] in bytes.
pub const MAX_STACK_BYTES: u32 = (MAX_STACK * core::mem::size_of::<u64>()) as u32;

/// `PARAMS` slot holding the namespace id used when the kernel layout does
/// not expose `sk_buff -> net_device -> net -> ns.inum`.
pub const FALLBACK_NS_SLOT: u32 = 0;

/// `PARAMS` slot holding the namespace id to filter on. 0 disables filtering.
pub const FILTER_NS_SLOT: u32 = 1;

/// Number of entries in the `PARAMS` array.
pub const PARAMS_LEN: u32 = 2;

/// One packet drop, emitted from the `skb/kfree_skb` tracepoint to userspace
/// through the `EVENTS` ring buffer.
///
/// The layout is a contract with the consumer: 4 + 4 + 20 * 8 = 168 bytes,
/// no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct DropEvent {
    /// Network namespace inode number, 0 when unknown.
    pub namespace_id: u32,
    /// Valid bytes in `stack`, always a multiple of 8 and at most 160.
    pub stack_size: u32,
    /// Kernel return addresses, most recent first. Unused tail is zero.
    pub stack: [u64; MAX_STACK],
}

impl DropEvent {
    pub const LEN: usize = core::mem::size_of::<DropEvent>();

    pub const fn new(namespace_id: u32) -> Self {
        Self {
            namespace_id,
            stack_size: 0,
            stack: [0; MAX_STACK],
        }
    }

    /// Number of valid entries in `stack`.
    pub fn depth(&self) -> usize {
        let depth = self.stack_size as usize / core::mem::size_of::<u64>();
        if depth > MAX_STACK {
            MAX_STACK
        } else {
            depth
        }
    }

    /// The captured frames, without the zero tail.
    pub fn frames(&self) -> &[u64] {
        &self.stack[..self.depth()]
    }
}

const _: () = {
    assert!(DropEvent::LEN == 168, "DropEvent must be exactly 168 bytes");
    assert!(
        core::mem::align_of::<DropEvent>() == 8,
        "DropEvent must be 8-byte aligned"
    );
};

/// Byte offsets of the links followed to reach a namespace id from an skb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldOffsets {
    /// `offsetof(struct sk_buff, dev)`
    pub skb_dev: u32,
    /// `offsetof(struct net_device, nd_net.net)`
    pub dev_nd_net: u32,
    /// `offsetof(struct net, ns.inum)`
    pub net_ns_inum: u32,
}

/// How the probe obtains the namespace id of a dropped packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceStrategy {
    /// Follow the skb through the kernel structures at the given offsets.
    Direct(FieldOffsets),
    /// Read [`FALLBACK_NS_SLOT`] from the config table.
    Fallback,
}

/// Load-time capability record, written by the loader into the probe's
/// read-only `NS_PROBE` global before the program is loaded.
///
/// `direct == 0` selects [`NamespaceStrategy::Fallback`]; the offsets are
/// only meaningful when `direct != 0`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize))]
pub struct NamespaceProbe {
    pub direct: u32,
    pub skb_dev: u32,
    pub dev_nd_net: u32,
    pub net_ns_inum: u32,
}

impl NamespaceProbe {
    pub const FALLBACK: NamespaceProbe = NamespaceProbe {
        direct: 0,
        skb_dev: 0,
        dev_nd_net: 0,
        net_ns_inum: 0,
    };

    pub const fn direct(offsets: FieldOffsets) -> Self {
        Self {
            direct: 1,
            skb_dev: offsets.skb_dev,
            dev_nd_net: offsets.dev_nd_net,
            net_ns_inum: offsets.net_ns_inum,
        }
    }

    pub const fn strategy(&self) -> NamespaceStrategy {
        if self.direct == 0 {
            NamespaceStrategy::Fallback
        } else {
            NamespaceStrategy::Direct(FieldOffsets {
                skb_dev: self.skb_dev,
                dev_nd_net: self.dev_nd_net,
                net_ns_inum: self.net_ns_inum,
            })
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for DropEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for NamespaceProbe {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        let event = DropEvent::new(7);
        let base = &event as *const DropEvent as usize;
        assert_eq!(&event.namespace_id as *const u32 as usize - base, 0);
        assert_eq!(&event.stack_size as *const u32 as usize - base, 4);
        assert_eq!(event.stack.as_ptr() as usize - base, 8);
        assert_eq!(MAX_STACK_BYTES, 160);
    }

    #[test]
    fn test_frames_excludes_zero_tail() {
        let mut event = DropEvent::new(1);
        event.stack[0] = 0xffff_ffff_8100_0000;
        event.stack[1] = 0xffff_ffff_8100_0040;
        event.stack_size = 16;
        assert_eq!(event.depth(), 2);
        assert_eq!(event.frames(), &[0xffff_ffff_8100_0000, 0xffff_ffff_8100_0040]);
    }

    #[test]
    fn test_depth_clamped_to_capacity() {
        let mut event = DropEvent::new(1);
        event.stack_size = u32::MAX;
        assert_eq!(event.depth(), MAX_STACK);
    }

    #[test]
    fn test_probe_strategy_tag() {
        assert_eq!(NamespaceProbe::FALLBACK.strategy(), NamespaceStrategy::Fallback);

        let offsets = FieldOffsets {
            skb_dev: 16,
            dev_nd_net: 280,
            net_ns_inum: 184,
        };
        let probe = NamespaceProbe::direct(offsets);
        assert_eq!(probe.strategy(), NamespaceStrategy::Direct(offsets));
    }
}
