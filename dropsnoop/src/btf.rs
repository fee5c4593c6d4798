use anyhow::{anyhow, bail, ensure, Context};
use std::fs;
use std::path::Path;

use dropsnoop_common::{FieldOffsets, NamespaceProbe};

const BTF_MAGIC: u16 = 0xeb9f;
const HEADER_LEN: usize = 24;
const MAX_NESTING: usize = 16;

const KIND_INT: u8 = 1;
const KIND_PTR: u8 = 2;
const KIND_ARRAY: u8 = 3;
const KIND_STRUCT: u8 = 4;
const KIND_UNION: u8 = 5;
const KIND_ENUM: u8 = 6;
const KIND_FWD: u8 = 7;
const KIND_TYPEDEF: u8 = 8;
const KIND_VOLATILE: u8 = 9;
const KIND_CONST: u8 = 10;
const KIND_RESTRICT: u8 = 11;
const KIND_FUNC: u8 = 12;
const KIND_FUNC_PROTO: u8 = 13;
const KIND_VAR: u8 = 14;
const KIND_DATASEC: u8 = 15;
const KIND_FLOAT: u8 = 16;
const KIND_DECL_TAG: u8 = 17;
const KIND_TYPE_TAG: u8 = 18;
const KIND_ENUM64: u8 = 19;

#[derive(Debug, Clone)]
struct Member {
    name_off: u32,
    type_id: u32,
    /// Bit offset from the start of the enclosing struct or union.
    bit_offset: u32,
}

#[derive(Debug, Clone)]
struct BtfType {
    name_off: u32,
    kind: u8,
    /// `size` for sized kinds, referenced type id otherwise.
    size_or_type: u32,
    members: Vec<Member>,
}

/// Just enough of a kernel BTF blob to answer "where is this field".
///
/// Only little-endian blobs are accepted; the probe targets `bpfel`.
#[derive(Debug)]
pub struct Btf {
    /// Index 0 is the implicit `void` type.
    types: Vec<BtfType>,
    strings: Vec<u8>,
}

impl Btf {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("failed to parse BTF from {}", path.display()))
    }

    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        ensure!(data.len() >= HEADER_LEN, "BTF blob too short ({} bytes)", data.len());
        let magic = u16::from_le_bytes([data[0], data[1]]);
        if magic == BTF_MAGIC.swap_bytes() {
            bail!("big-endian BTF is not supported");
        }
        ensure!(magic == BTF_MAGIC, "bad BTF magic {:#06x}", magic);

        let hdr_len = read_u32(data, 4)? as usize;
        let type_off = read_u32(data, 8)? as usize;
        let type_len = read_u32(data, 12)? as usize;
        let str_off = read_u32(data, 16)? as usize;
        let str_len = read_u32(data, 20)? as usize;

        let types_start = hdr_len + type_off;
        let types_end = types_start + type_len;
        let str_start = hdr_len + str_off;
        let str_end = str_start + str_len;
        ensure!(
            types_end <= data.len() && str_end <= data.len(),
            "BTF sections exceed blob length"
        );

        let types = parse_types(&data[types_start..types_end])?;
        Ok(Self {
            types,
            strings: data[str_start..str_end].to_vec(),
        })
    }

    fn name(&self, offset: u32) -> &str {
        let Some(tail) = self.strings.get(offset as usize..) else {
            return "";
        };
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    /// Finds a struct by name, preferring a definition with members over an
    /// empty one.
    fn struct_by_name(&self, name: &str) -> Option<u32> {
        let mut empty = None;
        for (id, ty) in self.types.iter().enumerate().skip(1) {
            if ty.kind != KIND_STRUCT || self.name(ty.name_off) != name {
                continue;
            }
            if !ty.members.is_empty() {
                return Some(id as u32);
            }
            empty.get_or_insert(id as u32);
        }
        empty
    }

    /// Skips typedefs and qualifiers.
    fn strip(&self, mut id: u32) -> Option<u32> {
        for _ in 0..MAX_NESTING {
            let ty = self.types.get(id as usize)?;
            match ty.kind {
                KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_TYPE_TAG => {
                    id = ty.size_or_type;
                }
                _ => return Some(id),
            }
        }
        None
    }

    /// Looks `name` up among the members of `id`, descending into anonymous
    /// structs and unions. Returns the bit offset and member type.
    fn find_member(&self, id: u32, name: &str, depth: usize) -> Option<(u32, u32)> {
        if depth > MAX_NESTING {
            return None;
        }
        let ty = self.types.get(self.strip(id)? as usize)?;
        if ty.kind != KIND_STRUCT && ty.kind != KIND_UNION {
            return None;
        }
        for member in &ty.members {
            if member.name_off != 0 && self.name(member.name_off) == name {
                return Some((member.bit_offset, member.type_id));
            }
        }
        for member in ty.members.iter().filter(|m| m.name_off == 0) {
            if let Some((bits, type_id)) = self.find_member(member.type_id, name, depth + 1) {
                return Some((member.bit_offset + bits, type_id));
            }
        }
        None
    }

    /// Byte offset of `path` (e.g. `["nd_net", "net"]`) inside `struct name`.
    pub fn member_offset(&self, struct_name: &str, path: &[&str]) -> anyhow::Result<u32> {
        let mut id = self
            .struct_by_name(struct_name)
            .ok_or_else(|| anyhow!("struct {} not found", struct_name))?;
        let mut bits = 0u32;
        for field in path {
            let (offset, member_type) = self
                .find_member(id, field, 0)
                .ok_or_else(|| anyhow!("struct {} has no member {}", struct_name, path.join(".")))?;
            bits += offset;
            id = member_type;
        }
        ensure!(
            bits % 8 == 0,
            "{}.{} is not byte aligned",
            struct_name,
            path.join(".")
        );
        Ok(bits / 8)
    }

    /// Offsets for `skb->dev->nd_net.net->ns.inum`.
    pub fn namespace_offsets(&self) -> anyhow::Result<FieldOffsets> {
        Ok(FieldOffsets {
            skb_dev: self.member_offset("sk_buff", &["dev"])?,
            dev_nd_net: self.member_offset("net_device", &["nd_net", "net"])?,
            net_ns_inum: self.member_offset("net", &["ns", "inum"])?,
        })
    }
}

/// Decides how the probe resolves namespaces on the running kernel.
///
/// Any problem reading the kernel's BTF selects the config-table fallback.
pub fn detect_namespace_probe(btf_path: &Path) -> NamespaceProbe {
    let offsets = Btf::from_file(btf_path).and_then(|btf| btf.namespace_offsets());
    match offsets {
        Ok(offsets) => {
            tracing::info!(
                "Direct namespace reads enabled (sk_buff.dev={}, net_device.nd_net={}, net.ns.inum={})",
                offsets.skb_dev,
                offsets.dev_nd_net,
                offsets.net_ns_inum
            );
            NamespaceProbe::direct(offsets)
        }
        Err(e) => {
            tracing::warn!("Direct namespace reads unavailable, using fallback: {:#}", e);
            NamespaceProbe::FALLBACK
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> anyhow::Result<u32> {
    let bytes = data
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("truncated BTF at offset {}", at))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_types(section: &[u8]) -> anyhow::Result<Vec<BtfType>> {
    let mut types = vec![BtfType {
        name_off: 0,
        kind: 0,
        size_or_type: 0,
        members: Vec::new(),
    }];

    let mut pos = 0;
    while pos < section.len() {
        let name_off = read_u32(section, pos)?;
        let info = read_u32(section, pos + 4)?;
        let size_or_type = read_u32(section, pos + 8)?;
        pos += 12;

        let kind = ((info >> 24) & 0x1f) as u8;
        let vlen = (info & 0xffff) as usize;
        let kind_flag = info >> 31 == 1;

        let mut members = Vec::new();
        let extra = match kind {
            KIND_INT | KIND_VAR | KIND_DECL_TAG => 4,
            KIND_PTR | KIND_FWD | KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT
            | KIND_FUNC | KIND_FLOAT | KIND_TYPE_TAG => 0,
            KIND_ARRAY => 12,
            KIND_STRUCT | KIND_UNION => {
                for i in 0..vlen {
                    let at = pos + i * 12;
                    let offset = read_u32(section, at + 8)?;
                    members.push(Member {
                        name_off: read_u32(section, at)?,
                        type_id: read_u32(section, at + 4)?,
                        bit_offset: if kind_flag { offset & 0x00ff_ffff } else { offset },
                    });
                }
                vlen * 12
            }
            KIND_ENUM | KIND_FUNC_PROTO => vlen * 8,
            KIND_DATASEC | KIND_ENUM64 => vlen * 12,
            other => bail!("unknown BTF kind {} at type {}", other, types.len()),
        };
        pos += extra;
        ensure!(pos <= section.len(), "truncated BTF type {}", types.len());

        types.push(BtfType {
            name_off,
            kind,
            size_or_type,
            members,
        });
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Assembles a little-endian BTF blob type by type.
    struct Builder {
        types: Vec<u8>,
        strings: Vec<u8>,
        next_id: u32,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                types: Vec::new(),
                strings: vec![0],
                next_id: 1,
            }
        }

        fn string(&mut self, s: &str) -> u32 {
            if s.is_empty() {
                return 0;
            }
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(s.as_bytes());
            self.strings.push(0);
            off
        }

        fn header(&mut self, name: &str, kind: u8, vlen: u32, kind_flag: bool, size_or_type: u32) -> u32 {
            let name_off = self.string(name);
            let info = ((kind as u32) << 24) | vlen | ((kind_flag as u32) << 31);
            for word in [name_off, info, size_or_type] {
                self.types.extend_from_slice(&word.to_le_bytes());
            }
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn int(&mut self, name: &str, size: u32) -> u32 {
            let id = self.header(name, KIND_INT, 0, false, size);
            self.types.extend_from_slice(&(size * 8).to_le_bytes());
            id
        }

        fn ptr(&mut self, target: u32) -> u32 {
            self.header("", KIND_PTR, 0, false, target)
        }

        fn typedef(&mut self, name: &str, target: u32) -> u32 {
            self.header(name, KIND_TYPEDEF, 0, false, target)
        }

        fn fwd(&mut self, name: &str) -> u32 {
            self.header(name, KIND_FWD, 0, false, 0)
        }

        fn composite(&mut self, kind: u8, name: &str, size: u32, kind_flag: bool, members: &[(&str, u32, u32)]) -> u32 {
            let id = self.header(name, kind, members.len() as u32, kind_flag, size);
            for (member, type_id, offset) in members {
                let name_off = self.string(member);
                for word in [name_off, *type_id, *offset] {
                    self.types.extend_from_slice(&word.to_le_bytes());
                }
            }
            id
        }

        fn finish(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&BTF_MAGIC.to_le_bytes());
            out.push(1);
            out.push(0);
            for word in [
                HEADER_LEN as u32,
                0,
                self.types.len() as u32,
                self.types.len() as u32,
                self.strings.len() as u32,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
            out.extend_from_slice(&self.types);
            out.extend_from_slice(&self.strings);
            out
        }
    }

    /// A cut-down kernel: `dev` nested inside anonymous unions like the
    /// real `sk_buff`, `possible_net_t` behind a typedef, `ns` encoded with
    /// bitfield offsets.
    fn kernel_blob(with_netns: bool) -> Vec<u8> {
        let mut b = Builder::new();
        let uint = b.int("unsigned int", 4);
        let ulong = b.int("long unsigned int", 8);
        let dev_fwd = b.fwd("net_device");
        let dev_ptr = b.ptr(dev_fwd);
        let skb_fwd = b.fwd("sk_buff");
        let skb_ptr = b.ptr(skb_fwd);

        let dev_union = b.composite(KIND_UNION, "", 8, false, &[("dev", dev_ptr, 0), ("dev_scratch", ulong, 0)]);
        let links = b.composite(
            KIND_STRUCT,
            "",
            24,
            false,
            &[("next", skb_ptr, 0), ("prev", skb_ptr, 64), ("", dev_union, 128)],
        );
        let head = b.composite(KIND_UNION, "", 24, false, &[("", links, 0)]);
        b.composite(KIND_STRUCT, "sk_buff", 232, false, &[("", head, 0), ("len", uint, 24 * 8)]);

        let net_fwd = b.fwd("net");
        let net_ptr = b.ptr(net_fwd);
        let possible = if with_netns {
            b.composite(KIND_STRUCT, "", 8, false, &[("net", net_ptr, 0)])
        } else {
            b.composite(KIND_STRUCT, "", 0, false, &[])
        };
        let possible_t = b.typedef("possible_net_t", possible);
        b.composite(
            KIND_STRUCT,
            "net_device",
            2048,
            false,
            &[("name", ulong, 0), ("nd_net", possible_t, 264 * 8)],
        );

        let ns_common = b.composite(
            KIND_STRUCT,
            "ns_common",
            24,
            true,
            &[("stashed", ulong, 0), ("ops", ulong, 64), ("inum", uint, 128)],
        );
        b.composite(KIND_STRUCT, "net", 4096, false, &[("passive", uint, 0), ("ns", ns_common, 176 * 8)]);
        b.finish()
    }

    #[test]
    fn test_resolves_namespace_chain() {
        let btf = Btf::parse(&kernel_blob(true)).unwrap();
        let offsets = btf.namespace_offsets().unwrap();
        assert_eq!(offsets.skb_dev, 16);
        assert_eq!(offsets.dev_nd_net, 264);
        assert_eq!(offsets.net_ns_inum, 176 + 16);
    }

    #[test]
    fn test_missing_netns_member_fails() {
        let btf = Btf::parse(&kernel_blob(false)).unwrap();
        let err = btf.namespace_offsets().unwrap_err();
        assert!(err.to_string().contains("nd_net.net"), "{err}");
    }

    #[test]
    fn test_forward_declaration_is_not_a_definition() {
        let btf = Btf::parse(&kernel_blob(true)).unwrap();
        // `sk_buff` exists both as FWD and STRUCT; only the struct has members.
        assert_eq!(btf.member_offset("sk_buff", &["len"]).unwrap(), 24);
        assert!(btf.member_offset("pt_regs", &["ip"]).is_err());
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let mut blob = kernel_blob(true);
        blob[0] = 0;
        assert!(Btf::parse(&blob).is_err());

        let blob = kernel_blob(true);
        assert!(Btf::parse(&blob[..blob.len() - 8]).is_err());
        assert!(Btf::parse(&blob[..10]).is_err());
    }

    #[test]
    fn test_detect_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&kernel_blob(true)).unwrap();
        let probe = detect_namespace_probe(file.path());
        assert_eq!(probe.direct, 1);
        assert_eq!(probe.skb_dev, 16);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&kernel_blob(false)).unwrap();
        assert_eq!(detect_namespace_probe(file.path()), NamespaceProbe::FALLBACK);
    }

    #[test]
    fn test_detect_without_btf_falls_back() {
        let probe = detect_namespace_probe(Path::new("/nonexistent/btf/vmlinux"));
        assert_eq!(probe, NamespaceProbe::FALLBACK);
    }
}
