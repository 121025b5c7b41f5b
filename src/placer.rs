//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Stage 3: drives placement of every vseg into its owning pseg, resolving each
//! vseg's content sources along the way (an ELF vobj's length is only known once
//! its backing section has been found, and that measurement feeds straight into
//! the packing arithmetic that determines the vseg's total length).

use crate::blob::{MappingBlob, PsegType, VobjType};
use crate::elf::ElfFile;
use crate::pseg::PSeg;
use crate::util::align_up;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a loadable vobj's bytes come from once resolved.
pub enum VobjBytes {
    File(Vec<u8>),
    /// The mapping blob re-injected as its own BLOB vobj (invariant 8): no copy is
    /// made here, the bytes are read back from the owning `MappingBlob` at emission
    /// time so that the lma written during this same pass stays visible.
    LiveBlob,
}

pub struct ResolvedVobj {
    pub vobj_type: VobjType,
    pub offset: u64,
    pub length: u32,
    pub data: Option<VobjBytes>,
}

pub struct PlacedVseg {
    pub name: String,
    pub lma: u64,
    pub length: u32,
    pub mode: u32,
    pub loadable: bool,
    pub vobjs: Vec<ResolvedVobj>,
}

pub struct Placer<'a> {
    blob: &'a mut MappingBlob,
    psegs: Vec<PSeg>,
    elf_cache: HashMap<PathBuf, ElfFile>,
    pub template_elf_path: Option<PathBuf>,
    pub verbose: bool,
}

impl<'a> Placer<'a> {
    pub fn new(blob: &'a mut MappingBlob, psegs: Vec<PSeg>, verbose: bool) -> Self {
        Placer {
            blob,
            psegs,
            elf_cache: HashMap::new(),
            template_elf_path: None,
            verbose,
        }
    }

    pub fn into_psegs(self) -> Vec<PSeg> {
        self.psegs
    }

    pub fn psegs(&self) -> &[PSeg] {
        &self.psegs
    }

    pub fn cached_elf(&self, path: &Path) -> Option<&ElfFile> {
        self.elf_cache.get(path)
    }

    fn get_elf(&mut self, path: &Path) -> Result<&ElfFile, String> {
        if !self.elf_cache.contains_key(path) {
            let elf = ElfFile::from_path(path)?;
            if self.template_elf_path.is_none() {
                self.template_elf_path = Some(path.to_owned());
            }
            self.elf_cache.insert(path.to_owned(), elf);
        }
        Ok(self.elf_cache.get(path).unwrap())
    }

    /// Drive placement across the whole blob: global vsegs (identity first, then
    /// free), then each vspace's private vsegs (identity first, then free).
    pub fn run(&mut self) -> Result<Vec<PlacedVseg>, String> {
        let mut placed = Vec::new();

        let globals = self.blob.global_vseg_count();
        self.run_scope(0, globals, &mut placed)?;

        let vspaces = self.blob.vspaces()?;
        for vspace in &vspaces {
            self.run_scope(vspace.vseg_offset, vspace.vseg_count, &mut placed)?;
        }

        for pseg in &self.psegs {
            pseg.check()?;
        }

        Ok(placed)
    }

    fn run_scope(
        &mut self,
        offset: usize,
        count: usize,
        placed: &mut Vec<PlacedVseg>,
    ) -> Result<(), String> {
        for ident_pass in [true, false] {
            for i in offset..offset + count {
                let vseg = self.blob.vseg_at(i)?;
                if vseg.ident != ident_pass {
                    continue;
                }
                if let Some(p) = self.place_one(i)? {
                    placed.push(p);
                }
            }
        }
        Ok(())
    }

    fn place_one(&mut self, vseg_index: usize) -> Result<Option<PlacedVseg>, String> {
        let vseg = self.blob.vseg_at(vseg_index)?;

        let pseg_type = self
            .psegs
            .get(vseg.psegid)
            .ok_or_else(|| {
                format!(
                    "vseg '{}': psegid {} does not name a declared pseg",
                    vseg.name, vseg.psegid
                )
            })?
            .pseg_type;
        if pseg_type == PsegType::Peri {
            return Ok(None);
        }

        let mut cur_length: u64 = 0;
        let mut resolved = Vec::with_capacity(vseg.vobjs.len());
        let vobj_base = self.blob.vseg_vobj_offset(vseg_index)?;

        for (pos, vobj) in vseg.vobjs.iter().enumerate() {
            if vobj.vobj_type == VobjType::Elf && pos != 0 {
                return Err(format!(
                    "vseg '{}': an ELF vobj must be the first vobj, found '{}' at position {}",
                    vseg.name, vobj.name, pos
                ));
            }

            if vobj.align > 0 {
                cur_length = align_up(cur_length, vobj.align as u64);
            }
            let offset = cur_length;

            let (measured_length, data) = match vobj.vobj_type {
                VobjType::Elf => {
                    let path = vobj
                        .binpath
                        .as_ref()
                        .ok_or_else(|| format!("vobj '{}': ELF vobj has no binpath", vobj.name))?;
                    let resolved_path = self.blob.resolve_path(path);
                    let running_vma = (vseg.vma as u64) + cur_length;

                    let elf = self.get_elf(&resolved_path)?;
                    let seg = elf.segment_at_vaddr(running_vma).ok_or_else(|| {
                        format!(
                            "vobj '{}': no section of '{}' loads at vaddr {:#x}",
                            vobj.name,
                            resolved_path.display(),
                            running_vma
                        )
                    })?;
                    let bytes = seg.data().clone();
                    (bytes.len() as u32, Some(VobjBytes::File(bytes)))
                }
                VobjType::Blob => {
                    let path = vobj
                        .binpath
                        .as_ref()
                        .ok_or_else(|| format!("vobj '{}': BLOB vobj has no binpath", vobj.name))?;
                    let resolved_path = self.blob.resolve_path(path);

                    if resolved_path == self.blob.path {
                        (self.blob.bytes.len() as u32, Some(VobjBytes::LiveBlob))
                    } else {
                        let bytes = std::fs::read(&resolved_path).map_err(|e| {
                            format!(
                                "vobj '{}': cannot read '{}': {}",
                                vobj.name,
                                resolved_path.display(),
                                e
                            )
                        })?;
                        (bytes.len() as u32, Some(VobjBytes::File(bytes)))
                    }
                }
                _ => (vobj.length, None),
            };

            if vobj.vobj_type.is_loadable() && measured_length > vobj.length {
                return Err(format!(
                    "vobj '{}': measured size {:#x} exceeds declared length {:#x}",
                    vobj.name, measured_length, vobj.length
                ));
            }

            if vobj.vobj_type.is_loadable() {
                self.blob.set_vobj_length(vobj_base + pos, measured_length)?;
            }

            cur_length += measured_length as u64;

            resolved.push(ResolvedVobj {
                vobj_type: vobj.vobj_type,
                offset,
                length: measured_length,
                data,
            });
        }

        if cur_length == 0 {
            return Err(format!("vseg '{}': zero-length vseg cannot be placed", vseg.name));
        }

        let align_bits = vseg.align_exponent() as u64;
        let pseg = &mut self.psegs[vseg.psegid];

        let lma = if vseg.ident {
            pseg.place_identity(vseg_index, &vseg.name, vseg.vma as u64, cur_length)?;
            vseg.vma as u64
        } else {
            pseg.place(vseg_index, &vseg.name, cur_length, align_bits)?
        };

        self.blob
            .set_vseg_placement(vseg_index, lma, cur_length as u32)?;

        let loadable = resolved.iter().any(|v| v.vobj_type.is_loadable());

        Ok(Some(PlacedVseg {
            name: vseg.name.clone(),
            lma,
            length: cur_length as u32,
            mode: vseg.mode,
            loadable,
            vobjs: resolved,
        }))
    }
}
