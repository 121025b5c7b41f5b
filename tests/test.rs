//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use mover::assembler;
use mover::blob::testing::{BlobBuilder, PsegSpec, VobjSpec, VsegSpec};
use mover::blob::MappingBlob;
use mover::placer::Placer;
use mover::pseg::build_table;
use std::path::PathBuf;

fn write_blob(bytes: &[u8], name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("mover-test-{name}-{}.bin", std::process::id()));
    std::fs::write(&path, bytes).unwrap();
    path
}

fn run_pipeline(bytes: &[u8], name: &str) -> (MappingBlob, Vec<mover::placer::PlacedVseg>) {
    let path = write_blob(bytes, name);
    let mut blob = MappingBlob::load(&path).unwrap();
    let psegs = build_table(&blob, 12).unwrap();
    let mut placer = Placer::new(&mut blob, psegs, false);
    let placed = placer.run().unwrap();
    std::fs::remove_file(&path).ok();
    (blob, placed)
}

#[cfg(test)]
mod end_to_end {
    use super::*;

    #[test]
    fn s1_single_vseg_fits_at_base() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0x0000_0000, 0x1000))
            .vseg(VsegSpec::new(
                "v0",
                0,
                0,
                false,
                vec![VobjSpec::buffer("b0", 0x400, 0)],
            ))
            .build();

        let path = write_blob(&bytes, "s1");
        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        let placed = placer.run().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].lma, 0x0000_0000);
    }

    #[test]
    fn s2_two_vsegs_packed_in_declaration_order() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .vseg(VsegSpec::new(
                "va",
                0,
                0,
                false,
                vec![VobjSpec::buffer("ba", 0x400, 0)],
            ))
            .vseg(VsegSpec::new(
                "vb",
                0,
                0,
                false,
                vec![VobjSpec::buffer("bb", 0x400, 0)],
            ))
            .build();

        let (_, placed) = run_pipeline(&bytes, "s2");
        assert_eq!(placed[0].lma, 0x0000_0000);
        assert_eq!(placed[1].lma, 0x0000_0400);
    }

    #[test]
    fn s3_identity_placed_before_free() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .vseg(VsegSpec::new(
                "v_free",
                0,
                0,
                false,
                vec![VobjSpec::buffer("bf", 0x400, 0)],
            ))
            .vseg(VsegSpec::new(
                "v_ident",
                0x800,
                0,
                true,
                vec![VobjSpec::buffer("bi", 0x400, 0)],
            ))
            .build();

        let (_, placed) = run_pipeline(&bytes, "s3");
        let ident = placed.iter().find(|v| v.name == "v_ident").unwrap();
        let free = placed.iter().find(|v| v.name == "v_free").unwrap();
        assert_eq!(ident.lma, 0x0000_0800);
        assert_eq!(free.lma, 0x0000_0000);
    }

    #[test]
    fn s4_alignment_pushes_second_vseg_to_next_page() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0x1000_0000, 0x1_0000))
            .vseg(VsegSpec::new(
                "va",
                0,
                0,
                false,
                vec![VobjSpec::buffer("ba", 0x100, 12)],
            ))
            .vseg(VsegSpec::new(
                "vb",
                0,
                0,
                false,
                vec![VobjSpec::buffer("bb", 0x100, 12)],
            ))
            .build();

        let (_, placed) = run_pipeline(&bytes, "s4");
        assert_eq!(placed[0].lma, 0x1000_0000);
        assert_eq!(placed[1].lma, 0x1000_1000);
    }

    #[test]
    fn s5_mapping_blob_reinjects_itself_with_assigned_lma() {
        // The vobj's binpath must equal the blob's own file name (resolved
        // relative to the blob's directory) for the placer's self-reference
        // detection to fire, so the path is fixed up front rather than patched
        // into the serialised bytes afterwards.
        let mut path = std::env::temp_dir();
        path.push(format!("mover-test-s5-selfref-{}.bin", std::process::id()));
        let name = path.file_name().unwrap().to_str().unwrap().to_string();

        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x2000))
            .vseg(VsegSpec::new(
                "v_self",
                0,
                0,
                false,
                vec![VobjSpec::blob_file("self_blob", 0x1000, 0, &name)],
            ))
            .build();
        std::fs::write(&path, &bytes).unwrap();

        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        let placed = placer.run().unwrap();

        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].lma, 0);

        let sections = assembler::assemble(&placed, &blob.bytes);
        assert_eq!(sections.len(), 1);
        // The re-injected section must carry the live blob bytes, including the
        // lma that was just written into the buffer in place.
        assert_eq!(sections[0].bytes.len(), placed[0].length as usize);
        assert_eq!(&sections[0].bytes[..blob.bytes.len().min(sections[0].bytes.len())], &blob.bytes[..]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn s6_capacity_exhausted_names_the_vseg() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .vseg(VsegSpec::new(
                "va",
                0,
                0,
                false,
                vec![VobjSpec::buffer("ba", 0x0C00, 0)],
            ))
            .vseg(VsegSpec::new(
                "vb",
                0,
                0,
                false,
                vec![VobjSpec::buffer("bb", 0x0500, 0)],
            ))
            .build();

        let path = write_blob(&bytes, "s6");
        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        let err = placer.run().unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(err.contains("vb"));
    }
}

#[cfg(test)]
mod invariants {
    use super::*;

    #[test]
    fn peri_vsegs_are_skipped_without_validation() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::peri("uart0", 0xF000_0000, 0x1000))
            .vseg(VsegSpec::new(
                "v_peri",
                0xF000_0000,
                0,
                true,
                vec![VobjSpec::buffer("p", 0x2000, 0)],
            ))
            .build();

        let (_, placed) = run_pipeline(&bytes, "peri");
        assert!(placed.is_empty());
    }

    #[test]
    fn two_identity_vsegs_sharing_a_byte_collide() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .vseg(VsegSpec::new(
                "a",
                0x100,
                0,
                true,
                vec![VobjSpec::buffer("ba", 0x100, 0)],
            ))
            .vseg(VsegSpec::new(
                "b",
                0x100,
                0,
                true,
                vec![VobjSpec::buffer("bb", 0x100, 0)],
            ))
            .build();

        let path = write_blob(&bytes, "collide");
        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        let err = placer.run().unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(err.contains("overlaps"));
    }

    #[test]
    fn vseg_lma_written_back_is_readable_from_reloaded_blob() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0x2000_0000, 0x1000))
            .vseg(VsegSpec::new(
                "v0",
                0,
                0,
                false,
                vec![VobjSpec::buffer("b0", 0x400, 0)],
            ))
            .build();

        let path = write_blob(&bytes, "roundtrip");
        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        placer.run().unwrap();

        let reread = blob.vseg_at(0).unwrap();
        assert_eq!(reread.lma, 0x2000_0000);
        assert_eq!(reread.length, 0x400);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .build();
        bytes[0] = 0;
        let path = write_blob(&bytes, "badsig");
        let err = MappingBlob::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.contains("signature"));
    }

    #[test]
    fn elf_vobj_must_be_first_in_its_vseg() {
        let bytes = BlobBuilder::new()
            .pseg(PsegSpec::ram("ram0", 0, 0x1000))
            .vseg(VsegSpec::new(
                "v0",
                0,
                0,
                false,
                vec![
                    VobjSpec::buffer("not_first", 0x10, 0),
                    VobjSpec::elf("code", 0x100, "nonexistent.elf"),
                ],
            ))
            .build();

        let path = write_blob(&bytes, "elf-order");
        let mut blob = MappingBlob::load(&path).unwrap();
        let psegs = build_table(&blob, 12).unwrap();
        let mut placer = Placer::new(&mut blob, psegs, false);
        let err = placer.run().unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(err.contains("first vobj"));
    }
}
