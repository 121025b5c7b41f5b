//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Stage 4: turns each placed, loadable vseg into one output section whose bytes
//! are the concatenation of its vobjs' resolved content, in declaration order,
//! padded to match the alignment gaps the placer already accounted for.

use crate::blob::{W_MODE_MASK, X_MODE_MASK};
use crate::placer::{PlacedVseg, VobjBytes};

pub struct AssembledSection {
    pub name: String,
    pub lma: u64,
    pub writable: bool,
    pub executable: bool,
    pub bytes: Vec<u8>,
}

/// `live_blob_bytes` is the mapping blob's own current buffer, consulted only for
/// vobjs that re-inject the blob as its own BLOB section (invariant 8).
pub fn assemble(placed: &[PlacedVseg], live_blob_bytes: &[u8]) -> Vec<AssembledSection> {
    placed
        .iter()
        .filter(|v| v.loadable)
        .map(|v| assemble_one(v, live_blob_bytes))
        .collect()
}

fn assemble_one(vseg: &PlacedVseg, live_blob_bytes: &[u8]) -> AssembledSection {
    let mut bytes = Vec::with_capacity(vseg.length as usize);
    for vobj in &vseg.vobjs {
        if (vobj.offset as usize) > bytes.len() {
            bytes.resize(vobj.offset as usize, 0);
        }
        match &vobj.data {
            Some(VobjBytes::File(content)) => bytes.extend_from_slice(content),
            Some(VobjBytes::LiveBlob) => bytes.extend_from_slice(live_blob_bytes),
            None => bytes.resize(bytes.len() + vobj.length as usize, 0),
        }
    }
    bytes.resize(vseg.length as usize, 0);

    AssembledSection {
        name: vseg.name.clone(),
        lma: vseg.lma,
        writable: vseg.mode & W_MODE_MASK != 0,
        executable: vseg.mode & X_MODE_MASK != 0,
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::VobjType;

    fn vseg(name: &str, lma: u64, mode: u32, vobjs: Vec<crate::placer::ResolvedVobj>) -> PlacedVseg {
        let length = vobjs.iter().map(|v| v.offset + v.length as u64).max().unwrap_or(0) as u32;
        PlacedVseg {
            name: name.to_string(),
            lma,
            length,
            mode,
            loadable: true,
            vobjs,
        }
    }

    #[test]
    fn test_concatenates_in_order() {
        let vobjs = vec![
            crate::placer::ResolvedVobj {
                vobj_type: VobjType::Blob,
                offset: 0,
                length: 4,
                data: Some(VobjBytes::File(vec![1, 2, 3, 4])),
            },
            crate::placer::ResolvedVobj {
                vobj_type: VobjType::Buffer,
                offset: 4,
                length: 4,
                data: None,
            },
        ];
        let placed = vseg("v0", 0x1000, 0, vobjs);
        let section = assemble_one(&placed, &[]);
        assert_eq!(section.bytes, vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(section.lma, 0x1000);
    }

    #[test]
    fn test_live_blob_reinjection() {
        let vobjs = vec![crate::placer::ResolvedVobj {
            vobj_type: VobjType::Blob,
            offset: 0,
            length: 3,
            data: Some(VobjBytes::LiveBlob),
        }];
        let placed = vseg("selfblob", 0x2000, 0, vobjs);
        let section = assemble_one(&placed, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(section.bytes, vec![0xAA, 0xBB, 0xCC]);
    }
}
