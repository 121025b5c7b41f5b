//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Diagnostic dumps for `-v` (assembled sections) and `-sm` (segment maps).
//! Plain `println!`, gated behind the CLI flags; there is no logging crate here.

use crate::assembler::AssembledSection;
use crate::pseg::PSeg;
use crate::util::human_size_strict;

pub fn print_sections(sections: &[AssembledSection]) {
    println!("# Assembled sections");
    for section in sections {
        let (count, unit) = human_size_strict(section.bytes.len() as u64);
        println!("\t- '{}'", section.name);
        println!("\t\t* lma:  {:#018x}", section.lma);
        println!("\t\t* size: {count} {unit}");
        println!(
            "\t\t* flags: {}{}",
            if section.writable { "W" } else { "-" },
            if section.executable { "X" } else { "-" },
        );
    }
}

pub fn print_segment_map(psegs: &[PSeg]) {
    println!("# Segment map");
    for pseg in psegs {
        let (count, unit) = human_size_strict(pseg.length);
        println!(
            "\t- pseg '{}': base {:#018x}, length {count} {unit}",
            pseg.name, pseg.lma
        );
        for placed in pseg.occupancy() {
            println!(
                "\t\t* vseg '{}': lma {:#018x}, length {:#x}",
                placed.vseg_name, placed.lma, placed.length
            );
        }
    }
}
