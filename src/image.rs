//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Stage 5: copies the first input ELF's file-format metadata into a fresh output
//! object, attaches every assembled section, and serialises it.

use crate::assembler::AssembledSection;
use crate::elf::{ElfFile, ElfSegmentData};
use std::path::Path;

pub fn write_image(
    template: &ElfFile,
    sections: &[AssembledSection],
    out: &Path,
) -> Result<u64, String> {
    let mut output = ElfFile::new_output_from_template(template, out.to_owned());

    for section in sections {
        output.add_segment(
            true,
            section.writable,
            section.executable,
            section.lma,
            ElfSegmentData::RealData(section.bytes.clone()),
        );
    }

    output.reserialise(out)
}
