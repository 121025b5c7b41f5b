//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Parsing and in-place mutation of the mapping blob: a packed header followed by
//! six contiguous arrays (clusters, psegs, vspaces, vsegs, vobjs, tasks).

use crate::util::{bytes_to_struct, struct_to_bytes};
use std::path::{Path, PathBuf};

pub const IN_MAPPING_SIGNATURE: u32 = 0xDACE_2014;
pub const OUT_MAPPING_SIGNATURE: u32 = 0xBABE_F00D;

pub const C_MODE_MASK: u32 = 0b1000;
pub const X_MODE_MASK: u32 = 0b0100;
pub const W_MODE_MASK: u32 = 0b0010;
pub const U_MODE_MASK: u32 = 0b0001;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PsegType {
    Ram,
    Peri,
}

impl PsegType {
    fn from_raw(raw: u32) -> Result<Self, String> {
        match raw {
            0 => Ok(PsegType::Ram),
            2 => Ok(PsegType::Peri),
            other => Err(format!("pseg: unknown type {other}")),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VsegType {
    Elf,
    Blob,
    Ptab,
    Peri,
    Buffer,
    Sched,
    Heap,
}

impl VsegType {
    fn from_raw(raw: u32) -> Result<Self, String> {
        match raw {
            0 => Ok(VsegType::Elf),
            1 => Ok(VsegType::Blob),
            2 => Ok(VsegType::Ptab),
            3 => Ok(VsegType::Peri),
            4 => Ok(VsegType::Buffer),
            5 => Ok(VsegType::Sched),
            6 => Ok(VsegType::Heap),
            other => Err(format!("vseg: unknown type {other}")),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VobjType {
    Elf,
    Blob,
    Ptab,
    Mwmr,
    Lock,
    Buffer,
    Barrier,
    Const,
    Memspace,
    Sched,
    Heap,
}

impl VobjType {
    fn from_raw(raw: u32) -> Result<Self, String> {
        match raw {
            0 => Ok(VobjType::Elf),
            1 => Ok(VobjType::Blob),
            2 => Ok(VobjType::Ptab),
            3 => Ok(VobjType::Mwmr),
            4 => Ok(VobjType::Lock),
            5 => Ok(VobjType::Buffer),
            6 => Ok(VobjType::Barrier),
            7 => Ok(VobjType::Const),
            8 => Ok(VobjType::Memspace),
            9 => Ok(VobjType::Sched),
            10 => Ok(VobjType::Heap),
            other => Err(format!("vobj: unknown type {other}")),
        }
    }

    /// True for the two types whose length is measured from a file rather than
    /// trusted from the blob: ELF sections and raw blobs.
    pub fn is_loadable(&self) -> bool {
        matches!(self, VobjType::Elf | VobjType::Blob)
    }
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawHeader {
    signature: u32,
    x_size: u32,
    y_size: u32,
    x_width: u32,
    y_width: u32,
    x_io: u32,
    y_io: u32,
    irq_per_proc: u32,
    use_ram_disk: u32,
    globals: u32,
    vspaces: u32,
    psegs: u32,
    vsegs: u32,
    vobjs: u32,
    tasks: u32,
    name: [u8; 64],
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawCluster {
    x: u32,
    y: u32,
    psegs: u32,
    pseg_offset: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawPseg {
    name: [u8; 32],
    base: u64,
    length: u64,
    type_: u32,
    clusterid: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawVspace {
    name: [u8; 32],
    vsegs: u32,
    tasks: u32,
    vseg_offset: u32,
    task_offset: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawVseg {
    name: [u8; 32],
    vbase: u32,
    pbase: u64,
    length: u32,
    psegid: u32,
    mode: u32,
    type_: u32,
    ident: u8,
    vobj_count: u32,
    vobj_offset: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawVobj {
    name: [u8; 32],
    binpath: [u8; 64],
    type_: u32,
    length: u32,
    align: u32,
    init: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct RawTask {
    name: [u8; 32],
    clusterid: u32,
    proclocid: u32,
    trdid: u32,
    stack_vseg_id: u32,
    heap_vseg_id: u32,
    startid: u32,
}

fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn encode_name(s: &str, out: &mut [u8]) {
    out.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(out.len() - 1);
    out[..n].copy_from_slice(&bytes[..n]);
}

pub struct Cluster {
    pub x: u32,
    pub y: u32,
    pub pseg_offset: usize,
    pub pseg_count: usize,
}

pub struct Vspace {
    pub name: String,
    pub vseg_offset: usize,
    pub vseg_count: usize,
}

#[derive(Clone)]
pub struct Vobj {
    pub name: String,
    pub vobj_type: VobjType,
    pub length: u32,
    pub align: u32,
    pub binpath: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Vseg {
    pub name: String,
    pub vma: u32,
    pub lma: u64,
    pub length: u32,
    pub psegid: usize,
    pub mode: u32,
    pub vseg_type: VsegType,
    pub ident: bool,
    pub vobjs: Vec<Vobj>,
}

impl Vseg {
    pub fn align_exponent(&self) -> u32 {
        self.vobjs.first().map(|v| v.align).unwrap_or(0)
    }

    pub fn is_loadable(&self) -> bool {
        self.vobjs.iter().any(|v| v.vobj_type.is_loadable())
    }
}

pub struct PsegDecl {
    pub name: String,
    pub base: u64,
    pub length: u64,
    pub pseg_type: PsegType,
}

/// Owns the raw blob bytes for the entire run. Downstream stages reconstruct typed
/// views over ranges of `bytes` on demand rather than retaining raw pointers, and
/// mutate `bytes` in place for fields that the output image must carry (`vseg.lma`,
/// `vobj.length`, the header signature).
pub struct MappingBlob {
    pub bytes: Vec<u8>,
    pub path: PathBuf,
    header: RawHeader,
    cluster_base: usize,
    pseg_base: usize,
    vspace_base: usize,
    vseg_base: usize,
    vobj_base: usize,
}

fn checked_slice(bytes: &[u8], start: usize, len: usize, what: &str) -> Result<&[u8], String> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| format!("{what}: offset overflow"))?;
    if end > bytes.len() {
        return Err(format!(
            "mapping blob truncated: need {end} bytes for {what}, have {}",
            bytes.len()
        ));
    }
    Ok(&bytes[start..end])
}

impl MappingBlob {
    pub fn load(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path)
            .map_err(|e| format!("mover: cannot read mapping blob '{}': {}", path.display(), e))?;

        let header_size = size_of::<RawHeader>();
        let header_bytes = checked_slice(&bytes, 0, header_size, "header")?;
        let header = *unsafe { bytes_to_struct::<RawHeader>(header_bytes) };

        let signature = header.signature;
        if signature != IN_MAPPING_SIGNATURE {
            return Err(format!(
                "mapping blob '{}': bad signature 0x{:08x}, expected 0x{:08x}",
                path.display(),
                signature,
                IN_MAPPING_SIGNATURE
            ));
        }

        let clusters = (header.x_size as usize) * (header.y_size as usize);
        let cluster_base = header_size;
        let pseg_base = cluster_base + clusters * size_of::<RawCluster>();
        let vspace_base = pseg_base + header.psegs as usize * size_of::<RawPseg>();
        let vseg_base = vspace_base + header.vspaces as usize * size_of::<RawVspace>();
        let vobj_base = vseg_base + header.vsegs as usize * size_of::<RawVseg>();
        let task_base = vobj_base + header.vobjs as usize * size_of::<RawVobj>();
        checked_slice(
            &bytes,
            task_base,
            header.tasks as usize * size_of::<RawTask>(),
            "task array",
        )?;

        Ok(MappingBlob {
            bytes,
            path: path.to_owned(),
            header,
            cluster_base,
            pseg_base,
            vspace_base,
            vseg_base,
            vobj_base,
        })
    }

    pub fn cluster_count(&self) -> usize {
        (self.header.x_size as usize) * (self.header.y_size as usize)
    }

    pub fn pseg_count(&self) -> usize {
        self.header.psegs as usize
    }

    pub fn vspace_count(&self) -> usize {
        self.header.vspaces as usize
    }

    pub fn global_vseg_count(&self) -> usize {
        self.header.globals as usize
    }

    pub fn clusters(&self) -> Result<Vec<Cluster>, String> {
        let mut out = Vec::with_capacity(self.cluster_count());
        for i in 0..self.cluster_count() {
            let start = self.cluster_base + i * size_of::<RawCluster>();
            let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawCluster>(), "cluster")?;
            let raw = unsafe { bytes_to_struct::<RawCluster>(raw_bytes) };
            out.push(Cluster {
                x: raw.x,
                y: raw.y,
                pseg_offset: raw.pseg_offset as usize,
                pseg_count: raw.psegs as usize,
            });
        }
        Ok(out)
    }

    pub fn pseg_decl(&self, index: usize) -> Result<PsegDecl, String> {
        let start = self.pseg_base + index * size_of::<RawPseg>();
        let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawPseg>(), "pseg")?;
        let raw = unsafe { bytes_to_struct::<RawPseg>(raw_bytes) };
        Ok(PsegDecl {
            name: decode_name(&raw.name),
            base: raw.base,
            length: raw.length,
            pseg_type: PsegType::from_raw(raw.type_)?,
        })
    }

    pub fn vspaces(&self) -> Result<Vec<Vspace>, String> {
        let mut out = Vec::with_capacity(self.vspace_count());
        for i in 0..self.vspace_count() {
            let start = self.vspace_base + i * size_of::<RawVspace>();
            let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawVspace>(), "vspace")?;
            let raw = unsafe { bytes_to_struct::<RawVspace>(raw_bytes) };
            out.push(Vspace {
                name: decode_name(&raw.name),
                vseg_offset: raw.vseg_offset as usize,
                vseg_count: raw.vsegs as usize,
            });
        }
        Ok(out)
    }

    fn vobj_at(&self, index: usize) -> Result<Vobj, String> {
        let start = self.vobj_base + index * size_of::<RawVobj>();
        let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawVobj>(), "vobj")?;
        let raw = unsafe { bytes_to_struct::<RawVobj>(raw_bytes) };
        let binpath_str = decode_name(&raw.binpath);
        Ok(Vobj {
            name: decode_name(&raw.name),
            vobj_type: VobjType::from_raw(raw.type_)?,
            length: raw.length,
            align: raw.align,
            binpath: if binpath_str.is_empty() {
                None
            } else {
                Some(PathBuf::from(binpath_str))
            },
        })
    }

    pub fn vseg_at(&self, index: usize) -> Result<Vseg, String> {
        let start = self.vseg_base + index * size_of::<RawVseg>();
        let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawVseg>(), "vseg")?;
        let raw = *unsafe { bytes_to_struct::<RawVseg>(raw_bytes) };

        let mut vobjs = Vec::with_capacity(raw.vobj_count as usize);
        for i in 0..raw.vobj_count as usize {
            vobjs.push(self.vobj_at(raw.vobj_offset as usize + i)?);
        }

        Ok(Vseg {
            name: decode_name(&raw.name),
            vma: raw.vbase,
            lma: raw.pbase,
            length: raw.length,
            psegid: raw.psegid as usize,
            mode: raw.mode,
            vseg_type: VsegType::from_raw(raw.type_)?,
            ident: raw.ident != 0,
            vobjs,
        })
    }

    /// Write the placed `lma` and the measured `length` back into the vseg's blob
    /// entry. This is the mutation stage 3 performs in place on the shared buffer.
    pub fn set_vseg_placement(&mut self, index: usize, lma: u64, length: u32) -> Result<(), String> {
        let start = self.vseg_base + index * size_of::<RawVseg>();
        let end = start + size_of::<RawVseg>();
        if end > self.bytes.len() {
            return Err(format!("vseg index {index} out of range"));
        }
        let raw_bytes = &mut self.bytes[start..end];
        let offset_of_pbase = std::mem::offset_of!(RawVseg, pbase);
        let offset_of_length = std::mem::offset_of!(RawVseg, length);
        raw_bytes[offset_of_pbase..offset_of_pbase + 8].copy_from_slice(&lma.to_le_bytes());
        raw_bytes[offset_of_length..offset_of_length + 4].copy_from_slice(&length.to_le_bytes());
        Ok(())
    }

    /// Write a vobj's measured length back into the blob in place (ELF/BLOB vobjs
    /// have their declared length replaced with the size actually found on disk).
    pub fn set_vobj_length(&mut self, index: usize, length: u32) -> Result<(), String> {
        let start = self.vobj_base + index * size_of::<RawVobj>();
        let end = start + size_of::<RawVobj>();
        if end > self.bytes.len() {
            return Err(format!("vobj index {index} out of range"));
        }
        let raw_bytes = &mut self.bytes[start..end];
        let offset_of_length = std::mem::offset_of!(RawVobj, length);
        raw_bytes[offset_of_length..offset_of_length + 4].copy_from_slice(&length.to_le_bytes());
        Ok(())
    }

    /// Global index of the first vobj belonging to vseg `index`, needed by the
    /// placer to call `set_vobj_length` while walking a vseg's vobj list.
    pub fn vseg_vobj_offset(&self, index: usize) -> Result<usize, String> {
        let start = self.vseg_base + index * size_of::<RawVseg>();
        let raw_bytes = checked_slice(&self.bytes, start, size_of::<RawVseg>(), "vseg")?;
        let raw = unsafe { bytes_to_struct::<RawVseg>(raw_bytes) };
        Ok(raw.vobj_offset as usize)
    }

    /// Rewrite the header signature from the input magic to the output magic, the
    /// last step the image writer performs before the blob is re-embedded.
    pub fn stamp_output_signature(&mut self) {
        self.bytes[0..4].copy_from_slice(&OUT_MAPPING_SIGNATURE.to_le_bytes());
    }

    pub fn name(&self) -> String {
        decode_name(&self.header.name)
    }

    /// Resolve a vobj's `binpath` relative to the directory containing the mapping
    /// blob file itself (not the process's current working directory), unless it is
    /// already absolute.
    pub fn resolve_path(&self, binpath: &Path) -> PathBuf {
        if binpath.is_absolute() {
            return binpath.to_owned();
        }
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(binpath),
            _ => binpath.to_owned(),
        }
    }
}

/// Programmatic construction of synthetic mapping blobs, since this crate has no
/// XML front end to produce `.bin` fixtures from. Used by the integration tests to
/// build minimal single-cluster, single-pseg blobs for each scenario.
pub mod testing {
    use super::*;

    pub struct VobjSpec {
        pub name: String,
        pub vobj_type: u32,
        pub length: u32,
        pub align: u32,
        pub binpath: String,
    }

    impl VobjSpec {
        pub fn buffer(name: &str, length: u32, align: u32) -> Self {
            VobjSpec {
                name: name.to_string(),
                vobj_type: 5, // VOBJ_TYPE_BUFFER
                length,
                align,
                binpath: String::new(),
            }
        }

        pub fn blob_file(name: &str, length: u32, align: u32, binpath: &str) -> Self {
            VobjSpec {
                name: name.to_string(),
                vobj_type: 1, // VOBJ_TYPE_BLOB
                length,
                align,
                binpath: binpath.to_string(),
            }
        }

        pub fn elf(name: &str, length: u32, binpath: &str) -> Self {
            VobjSpec {
                name: name.to_string(),
                vobj_type: 0, // VOBJ_TYPE_ELF
                length,
                align: 0,
                binpath: binpath.to_string(),
            }
        }
    }

    pub struct VsegSpec {
        pub name: String,
        pub vma: u32,
        pub psegid: u32,
        pub mode: u32,
        pub vseg_type: u32,
        pub ident: bool,
        pub vobjs: Vec<VobjSpec>,
    }

    impl VsegSpec {
        pub fn new(name: &str, vma: u32, psegid: u32, ident: bool, vobjs: Vec<VobjSpec>) -> Self {
            VsegSpec {
                name: name.to_string(),
                vma,
                psegid,
                mode: W_MODE_MASK,
                vseg_type: 4, // VSEG_TYPE_BUFFER, irrelevant to placement
                ident,
                vobjs,
            }
        }
    }

    pub struct PsegSpec {
        pub name: String,
        pub base: u64,
        pub length: u64,
        pub pseg_type: u32,
    }

    impl PsegSpec {
        pub fn ram(name: &str, base: u64, length: u64) -> Self {
            PsegSpec {
                name: name.to_string(),
                base,
                length,
                pseg_type: 0,
            }
        }

        pub fn peri(name: &str, base: u64, length: u64) -> Self {
            PsegSpec {
                name: name.to_string(),
                base,
                length,
                pseg_type: 2,
            }
        }
    }

    #[derive(Default)]
    pub struct BlobBuilder {
        pub psegs: Vec<PsegSpec>,
        pub global_vsegs: Vec<VsegSpec>,
    }

    impl BlobBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pseg(mut self, p: PsegSpec) -> Self {
            self.psegs.push(p);
            self
        }

        pub fn vseg(mut self, v: VsegSpec) -> Self {
            self.global_vsegs.push(v);
            self
        }

        /// Serialise the builder into the on-disk byte layout `MappingBlob::load`
        /// expects: one cluster owning every declared pseg, no vspaces, all vsegs
        /// global.
        pub fn build(&self) -> Vec<u8> {
            let vobj_total: usize = self.global_vsegs.iter().map(|v| v.vobjs.len()).sum();

            let header = RawHeader {
                signature: IN_MAPPING_SIGNATURE,
                x_size: 1,
                y_size: 1,
                x_width: 1,
                y_width: 1,
                x_io: 0,
                y_io: 0,
                irq_per_proc: 0,
                use_ram_disk: 0,
                globals: self.global_vsegs.len() as u32,
                vspaces: 0,
                psegs: self.psegs.len() as u32,
                vsegs: self.global_vsegs.len() as u32,
                vobjs: vobj_total as u32,
                tasks: 0,
                name: [0; 64],
            };

            let mut bytes = Vec::new();
            bytes.extend_from_slice(unsafe { struct_to_bytes(&header) });

            let cluster = RawCluster {
                x: 0,
                y: 0,
                psegs: self.psegs.len() as u32,
                pseg_offset: 0,
            };
            bytes.extend_from_slice(unsafe { struct_to_bytes(&cluster) });

            for p in &self.psegs {
                let mut name = [0u8; 32];
                encode_name(&p.name, &mut name);
                let raw = RawPseg {
                    name,
                    base: p.base,
                    length: p.length,
                    type_: p.pseg_type,
                    clusterid: 0,
                };
                bytes.extend_from_slice(unsafe { struct_to_bytes(&raw) });
            }

            let mut vobj_offset = 0u32;
            let mut vseg_raws = Vec::new();
            for v in &self.global_vsegs {
                let mut name = [0u8; 32];
                encode_name(&v.name, &mut name);
                vseg_raws.push(RawVseg {
                    name,
                    vbase: v.vma,
                    pbase: 0,
                    length: 0,
                    psegid: v.psegid,
                    mode: v.mode,
                    type_: v.vseg_type,
                    ident: v.ident as u8,
                    vobj_count: v.vobjs.len() as u32,
                    vobj_offset,
                });
                vobj_offset += v.vobjs.len() as u32;
            }
            for raw in &vseg_raws {
                bytes.extend_from_slice(unsafe { struct_to_bytes(raw) });
            }

            for v in &self.global_vsegs {
                for vobj in &v.vobjs {
                    let mut name = [0u8; 32];
                    encode_name(&vobj.name, &mut name);
                    let mut binpath = [0u8; 64];
                    encode_name(&vobj.binpath, &mut binpath);
                    let raw = RawVobj {
                        name,
                        binpath,
                        type_: vobj.vobj_type,
                        length: vobj.length,
                        align: vobj.align,
                        init: 0,
                    };
                    bytes.extend_from_slice(unsafe { struct_to_bytes(&raw) });
                }
            }

            bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_name_roundtrip() {
        let mut buf = [0u8; 32];
        encode_name("core0", &mut buf);
        assert_eq!(decode_name(&buf), "core0");
    }

    #[test]
    fn test_decode_name_empty() {
        let buf = [0u8; 16];
        assert_eq!(decode_name(&buf), "");
    }

    #[test]
    fn test_vobj_type_is_loadable() {
        assert!(VobjType::Elf.is_loadable());
        assert!(VobjType::Blob.is_loadable());
        assert!(!VobjType::Buffer.is_loadable());
    }
}
