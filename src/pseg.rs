//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Physical segment table and the vseg placement algorithm.
//!
//! Each [`PSeg`] keeps its placed vsegs in an occupancy list ordered by `lma`, so a
//! free gap can be found by scanning adjacent pairs exactly once per placement
//! rather than re-deriving "current" and "next" by repeated linear scans.

use crate::blob::{MappingBlob, PsegType};
use crate::util::align_up;

/// Stage 2: flatten every pseg declared under every cluster into one globally
/// indexed table. The blob already stores pseg records in one flat array indexed
/// the same way vseg records name their owner, so building the table is a
/// straight walk; cluster membership only matters for diagnostics, not for the
/// index a vseg's `psegid` refers to.
pub fn build_table(blob: &MappingBlob, page_size_bits: u64) -> Result<Vec<PSeg>, String> {
    let mut psegs = Vec::with_capacity(blob.pseg_count());
    for i in 0..blob.pseg_count() {
        let decl = blob.pseg_decl(i)?;
        if decl.pseg_type == PsegType::Ram && decl.length % (1u64 << page_size_bits) != 0 {
            return Err(format!(
                "pseg '{}': length {:#x} is not a multiple of the page size",
                decl.name, decl.length
            ));
        }
        psegs.push(PSeg::new(
            decl.name,
            decl.base,
            decl.length,
            decl.pseg_type,
            page_size_bits,
        ));
    }
    Ok(psegs)
}

#[derive(Clone)]
pub struct Placed {
    pub lma: u64,
    pub length: u64,
    pub vseg_index: usize,
    pub vseg_name: String,
}

pub struct PSeg {
    pub name: String,
    pub lma: u64,
    pub length: u64,
    pub pseg_type: PsegType,
    pub page_size_bits: u64,
    occupancy: Vec<Placed>,
}

fn intervals_overlap(a_lma: u64, a_len: u64, b_lma: u64, b_len: u64) -> bool {
    let (a_start, a_end) = (a_lma, a_lma + a_len);
    let (b_start, b_end) = (b_lma, b_lma + b_len);
    a_start < b_end && b_start < a_end
}

impl PSeg {
    pub fn new(name: String, lma: u64, length: u64, pseg_type: PsegType, page_size_bits: u64) -> Self {
        PSeg {
            name,
            lma,
            length,
            pseg_type,
            page_size_bits,
            occupancy: Vec::new(),
        }
    }

    pub fn occupancy(&self) -> &[Placed] {
        &self.occupancy
    }

    fn insert_sorted(&mut self, placed: Placed) {
        let pos = self
            .occupancy
            .partition_point(|p| p.lma < placed.lma);
        self.occupancy.insert(pos, placed);
    }

    /// Find a gap for a vseg of length `length` aligned to `2^align_bits`, scanning the
    /// occupancy list in sorted order. Returns the chosen lma, or an error naming the
    /// vseg and pseg on capacity exhaustion.
    pub fn place(
        &mut self,
        vseg_index: usize,
        vseg_name: &str,
        length: u64,
        vseg_align_bits: u64,
    ) -> Result<u64, String> {
        if length == 0 {
            return Err(format!(
                "vseg '{vseg_name}': zero-length vseg cannot be placed"
            ));
        }

        let align_bits = vseg_align_bits.max(self.page_size_bits);

        if self.occupancy.is_empty() {
            if length > self.length {
                return Err(format!(
                    "vseg '{}': not enough space to map in pseg '{}' (needs {:#x}, pseg has {:#x})",
                    vseg_name, self.name, length, self.length
                ));
            }
            let lma = self.lma;
            self.insert_sorted(Placed {
                lma,
                length,
                vseg_index,
                vseg_name: vseg_name.to_string(),
            });
            return Ok(lma);
        }

        let pseg_end = self.lma + self.length;
        let mut prev_end = self.lma;
        for occ in self.occupancy.clone() {
            let candidate = align_up(prev_end, align_bits);
            if candidate + length <= occ.lma {
                self.insert_sorted(Placed {
                    lma: candidate,
                    length,
                    vseg_index,
                    vseg_name: vseg_name.to_string(),
                });
                return Ok(candidate);
            }
            prev_end = occ.lma + occ.length;
        }

        let candidate = align_up(prev_end, align_bits);
        if candidate + length <= pseg_end {
            self.insert_sorted(Placed {
                lma: candidate,
                length,
                vseg_index,
                vseg_name: vseg_name.to_string(),
            });
            return Ok(candidate);
        }

        Err(format!(
            "vseg '{}': not enough space to map in pseg '{}'",
            vseg_name, self.name
        ))
    }

    /// Place a vseg that requires `lma == vma` exactly. Fails if the requested
    /// interval overlaps any vseg already placed in this pseg.
    pub fn place_identity(
        &mut self,
        vseg_index: usize,
        vseg_name: &str,
        vma: u64,
        length: u64,
    ) -> Result<(), String> {
        if length == 0 {
            return Err(format!(
                "vseg '{vseg_name}': zero-length vseg cannot be placed"
            ));
        }

        if vma < self.lma || vma + length > self.lma + self.length {
            return Err(format!(
                "vseg '{}': identity address {:#x} does not fit in pseg '{}'",
                vseg_name, vma, self.name
            ));
        }

        for occ in &self.occupancy {
            if intervals_overlap(vma, length, occ.lma, occ.length) {
                return Err(format!(
                    "vseg '{}' overlaps already-placed vseg '{}' in pseg '{}'",
                    vseg_name, occ.vseg_name, self.name
                ));
            }
        }

        self.insert_sorted(Placed {
            lma: vma,
            length,
            vseg_index,
            vseg_name: vseg_name.to_string(),
        });
        Ok(())
    }

    /// Post-pass consistency check: re-verify that every pair of placed vsegs in
    /// this pseg is disjoint. Redundant on a correct run, but catches placement
    /// bugs independent of what each individual call already checked.
    pub fn check(&self) -> Result<(), String> {
        if self.pseg_type == PsegType::Peri {
            return Ok(());
        }
        for i in 0..self.occupancy.len() {
            for j in (i + 1)..self.occupancy.len() {
                let a = &self.occupancy[i];
                let b = &self.occupancy[j];
                if intervals_overlap(a.lma, a.length, b.lma, b.length) {
                    return Err(format!(
                        "pseg '{}': vseg '{}' overlaps vseg '{}'",
                        self.name, a.vseg_name, b.vseg_name
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseg(lma: u64, length: u64) -> PSeg {
        PSeg::new("ram0".to_string(), lma, length, PsegType::Ram, 12)
    }

    #[test]
    fn test_s1_single_fit() {
        let mut p = pseg(0, 0x1000);
        let lma = p.place(0, "v0", 0x400, 0).unwrap();
        assert_eq!(lma, 0);
    }

    #[test]
    fn test_s2_two_adjacent() {
        let mut p = pseg(0, 0x1000);
        let a = p.place(0, "va", 0x400, 0).unwrap();
        let b = p.place(1, "vb", 0x400, 0).unwrap();
        assert_eq!(a, 0x0000_0000);
        assert_eq!(b, 0x0000_0400);
    }

    #[test]
    fn test_s3_identity_before_free() {
        let mut p = pseg(0, 0x1000);
        p.place_identity(0, "v_ident", 0x800, 0x400).unwrap();
        let free = p.place(1, "v_free", 0x400, 0).unwrap();
        assert_eq!(free, 0x0000_0000);
    }

    #[test]
    fn test_s4_alignment() {
        let mut p = pseg(0x1000_0000, 0x1_0000);
        let a = p.place(0, "va", 0x100, 12).unwrap();
        assert_eq!(a, 0x1000_0000);
        let b = p.place(1, "vb", 0x100, 12).unwrap();
        assert_eq!(b, 0x1000_1000);
    }

    #[test]
    fn test_s6_capacity_exhausted() {
        let mut p = pseg(0, 0x1000);
        p.place(0, "va", 0x0C00, 0).unwrap();
        let err = p.place(1, "vb", 0x0500, 0);
        assert!(err.is_err());
        assert!(err.unwrap_err().contains("vb"));
    }

    #[test]
    fn test_exact_fill_then_reject() {
        let mut p = pseg(0, 0x1000);
        p.place(0, "va", 0x1000, 0).unwrap();
        assert!(p.place(1, "vb", 1, 0).is_err());
    }

    #[test]
    fn test_middle_hole() {
        let mut p = pseg(0, 0x3000);
        p.place(0, "left", 0x1000, 0).unwrap();
        p.place_identity(1, "right", 0x2000, 0x1000).unwrap();
        let hole = p.place(2, "middle", 0x1000, 0).unwrap();
        assert_eq!(hole, 0x1000);
    }

    #[test]
    fn test_identity_overlap_rejected() {
        let mut p = pseg(0, 0x1000);
        p.place_identity(0, "a", 0x100, 0x100).unwrap();
        let err = p.place_identity(1, "b", 0x100, 0x100);
        assert!(err.is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut p = pseg(0, 0x1000);
        assert!(p.place(0, "z", 0, 0).is_err());
    }

    #[test]
    fn test_consistency_check_passes() {
        let mut p = pseg(0, 0x1000);
        p.place(0, "a", 0x400, 0).unwrap();
        p.place(1, "b", 0x400, 0).unwrap();
        assert!(p.check().is_ok());
    }
}
