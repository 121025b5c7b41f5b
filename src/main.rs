//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use mover::assembler;
use mover::blob::MappingBlob;
use mover::image;
use mover::placer::Placer;
use mover::pseg::build_table;
use mover::report;

const PAGE_SIZE_BITS: u64 = 12; // 4 KiB pages

fn print_usage() {
    println!("usage: mover [-h] [-o OUTPUT] [-v] [-sm] <mapping-blob-path>");
}

fn print_help() {
    print_usage();
    println!("\npositional arguments:");
    println!("  mapping-blob-path");
    println!("\noptions:");
    println!("  -h, --help            show this help message and exit");
    println!("  -o, --output OUTPUT   output image path (default: soft.elf)");
    println!("  -v                    dump assembled sections");
    println!("  -sm                   dump the final segment map");
}

struct Args<'a> {
    mapping_blob_path: &'a str,
    output: &'a str,
    verbose: bool,
    segment_map: bool,
}

impl<'a> Args<'a> {
    pub fn parse(args: &'a [String]) -> Args<'a> {
        let mut output = "soft.elf";
        let mut verbose = false;
        let mut segment_map = false;
        let mut mapping_blob_path = None;

        if args.len() <= 1 {
            print_usage();
            std::process::exit(1);
        }

        let mut i = 1;
        let mut unknown = vec![];
        while i < args.len() {
            match args[i].as_str() {
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-o" | "--output" => {
                    if i < args.len() - 1 {
                        output = &args[i + 1];
                        i += 1;
                    } else {
                        eprintln!("mover: error: argument -o/--output: expected one argument");
                        std::process::exit(1);
                    }
                }
                "-v" => verbose = true,
                "-sm" => segment_map = true,
                _ => {
                    if mapping_blob_path.is_none() {
                        mapping_blob_path = Some(args[i].as_str());
                    } else {
                        unknown.push(args[i].clone());
                    }
                }
            }

            i += 1;
        }

        if !unknown.is_empty() {
            print_usage();
            eprintln!("mover: error: unrecognised arguments: {}", unknown.join(" "));
            std::process::exit(1);
        }

        let Some(mapping_blob_path) = mapping_blob_path else {
            print_usage();
            eprintln!("mover: error: the following arguments are required: mapping-blob-path");
            std::process::exit(1);
        };

        Args {
            mapping_blob_path,
            output,
            verbose,
            segment_map,
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let mut blob = MappingBlob::load(std::path::Path::new(args.mapping_blob_path))?;

    let psegs = build_table(&blob, PAGE_SIZE_BITS)?;

    let mut placer = Placer::new(&mut blob, psegs, args.verbose);
    let placed = placer.run()?;

    if args.segment_map {
        report::print_segment_map(placer.psegs());
    }

    let template_path = placer
        .template_elf_path
        .clone()
        .ok_or_else(|| "mover: no ELF object was opened; cannot determine output format".to_string())?;
    let template = placer
        .cached_elf(&template_path)
        .cloned()
        .ok_or_else(|| format!("mover: internal error: template ELF '{}' not cached", template_path.display()))?;

    blob.stamp_output_signature();

    let sections = assembler::assemble(&placed, &blob.bytes);

    if args.verbose {
        report::print_sections(&sections);
    }

    let output_path = std::path::Path::new(args.output);
    image::write_image(&template, &sections, output_path)?;

    Ok(())
}

fn main() {
    let arg_strs: Vec<String> = std::env::args().collect();
    let args = Args::parse(&arg_strs);

    if let Err(msg) = run(&args) {
        eprintln!("mover: error: {msg}");
        std::process::exit(1);
    }
}
