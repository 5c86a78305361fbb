//! EDASM command-line shell: a thin layer over the emulator and
//! assembler cores.
//!
//! Subcommands:
//!   run   — execute a 65C02 binary under the ProDOS/host-shim traps
//!   asm   — assemble 6502 source to a flat binary or REL module
//!   link  — link REL modules into BIN / REL / SYS output

mod asm;
mod config;
mod emulator;
mod files;

use std::path::PathBuf;
use std::process::ExitCode;

use config::Config;
use emulator::{Machine, MachineOptions, RunOutcome};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        print_usage();
        return ExitCode::from(2);
    };

    match command.as_str() {
        "run" => cmd_run(rest),
        "asm" => cmd_asm(rest),
        "link" => cmd_link(rest),
        "--help" | "help" => {
            print_usage();
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            ExitCode::from(2)
        }
    }
}

fn print_usage() {
    eprintln!("EDASM 65C02 emulator and assembler");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  edasm run --binary PATH [--load HEX] [--entry HEX] [--max N]");
    eprintln!("            [--input-file PATH] [--rom PATH] [--trace]");
    eprintln!("  edasm asm SOURCE -o OUTPUT");
    eprintln!("  edasm link FILE... -o OUTPUT [--origin HEX] [--type bin|rel|sys] [--map]");
}

fn parse_hex(value: &str) -> Result<u16, String> {
    let trimmed = value.trim_start_matches('$').trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).map_err(|e| format!("bad hex address '{value}': {e}"))
}

// ── run ───────────────────────────────────────────────────────

fn cmd_run(args: &[String]) -> ExitCode {
    let config = Config::load();
    let mut options = MachineOptions {
        load_address: config.load_address,
        max_instructions: config.max_instructions,
        dump_path: PathBuf::from(&config.dump_path),
        ..Default::default()
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        let result = match arg.as_str() {
            "--binary" => value("--binary").map(|v| options.binary = Some(PathBuf::from(v))),
            "--load" => value("--load")
                .and_then(|v| parse_hex(&v))
                .map(|v| options.load_address = v),
            "--entry" => value("--entry")
                .and_then(|v| parse_hex(&v))
                .map(|v| options.entry = Some(v)),
            "--max" => value("--max")
                .and_then(|v| v.parse::<u64>().map_err(|e| format!("bad --max: {e}")))
                .map(|v| options.max_instructions = v),
            "--input-file" => value("--input-file").and_then(|v| {
                std::fs::read_to_string(&v)
                    .map(|text| {
                        options.input_lines = text.lines().map(str::to_string).collect();
                    })
                    .map_err(|e| format!("cannot read input file {v}: {e}"))
            }),
            "--rom" => value("--rom").map(|v| options.rom = Some(PathBuf::from(v))),
            "--trace" => {
                options.trace = true;
                Ok(())
            }
            other => Err(format!("unknown flag: {other}")),
        };
        if let Err(e) = result {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    }

    if options.binary.is_none() {
        eprintln!("run: --binary is required");
        return ExitCode::from(2);
    }

    let mut machine = match Machine::new(options) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match machine.run() {
        RunOutcome::Halted => ExitCode::SUCCESS,
        RunOutcome::InstructionCapReached => ExitCode::FAILURE,
    }
}

// ── asm ───────────────────────────────────────────────────────

fn cmd_asm(args: &[String]) -> ExitCode {
    let config = Config::load();
    let mut source_path: Option<PathBuf> = None;
    let mut output_path: Option<PathBuf> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "--output" => match iter.next() {
                Some(v) => output_path = Some(PathBuf::from(v)),
                None => {
                    eprintln!("-o requires a value");
                    return ExitCode::from(2);
                }
            },
            flag if flag.starts_with('-') => {
                eprintln!("unknown flag: {flag}");
                return ExitCode::from(2);
            }
            path => source_path = Some(PathBuf::from(path)),
        }
    }

    let (Some(source_path), Some(output_path)) = (source_path, output_path) else {
        eprintln!("asm: usage: edasm asm SOURCE -o OUTPUT");
        return ExitCode::from(2);
    };

    let source = match std::fs::read_to_string(&source_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot read {}: {e}", source_path.display());
            return ExitCode::FAILURE;
        }
    };

    let base_path = source_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut assembler = asm::assembler::Assembler::new();
    let result = assembler.assemble(
        &source,
        asm::assembler::Options {
            base_path,
            include_depth_limit: config.include_depth_limit,
        },
    );

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    if !result.success {
        for error in &result.errors {
            eprintln!("error: {error}");
        }
        return ExitCode::FAILURE;
    }

    let bytes = if result.is_rel {
        &result.rel_data
    } else {
        &result.code
    };
    if let Err(e) = std::fs::write(&output_path, bytes) {
        eprintln!("cannot write {}: {e}", output_path.display());
        return ExitCode::FAILURE;
    }

    println!(
        "{}: {} bytes at ${:04X}{}",
        output_path.display(),
        result.code_length,
        result.org_address,
        if result.is_rel { " (REL module)" } else { "" }
    );
    ExitCode::SUCCESS
}

// ── link ──────────────────────────────────────────────────────

fn cmd_link(args: &[String]) -> ExitCode {
    let mut inputs: Vec<PathBuf> = Vec::new();
    let mut output_path: Option<PathBuf> = None;
    let mut options = asm::linker::Options::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "--output" => match iter.next() {
                Some(v) => output_path = Some(PathBuf::from(v)),
                None => {
                    eprintln!("-o requires a value");
                    return ExitCode::from(2);
                }
            },
            "--origin" => match iter.next().map(|v| parse_hex(v)) {
                Some(Ok(v)) => options.origin = v,
                Some(Err(e)) => {
                    eprintln!("{e}");
                    return ExitCode::from(2);
                }
                None => {
                    eprintln!("--origin requires a value");
                    return ExitCode::from(2);
                }
            },
            "--type" => match iter.next().map(String::as_str) {
                Some("bin") => options.output_type = asm::linker::OutputType::Bin,
                Some("rel") => options.output_type = asm::linker::OutputType::Rel,
                Some("sys") => options.output_type = asm::linker::OutputType::Sys,
                Some(other) => {
                    eprintln!("unknown output type: {other}");
                    return ExitCode::from(2);
                }
                None => {
                    eprintln!("--type requires a value");
                    return ExitCode::from(2);
                }
            },
            "--map" => options.generate_map = true,
            flag if flag.starts_with('-') => {
                eprintln!("unknown flag: {flag}");
                return ExitCode::from(2);
            }
            path => inputs.push(PathBuf::from(path)),
        }
    }

    let Some(output_path) = output_path else {
        eprintln!("link: usage: edasm link FILE... -o OUTPUT");
        return ExitCode::from(2);
    };
    if inputs.is_empty() {
        eprintln!("link: no input files");
        return ExitCode::from(2);
    }

    let generate_map = options.generate_map;
    let mut linker = asm::linker::Linker::new();
    let result = linker.link_files(&inputs, options);

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    if !result.success {
        for error in &result.errors {
            eprintln!("error: {error}");
        }
        return ExitCode::FAILURE;
    }

    if let Err(e) = std::fs::write(&output_path, &result.output) {
        eprintln!("cannot write {}: {e}", output_path.display());
        return ExitCode::FAILURE;
    }
    if generate_map {
        print!("{}", result.load_map);
    }

    println!(
        "{}: {} bytes at ${:04X}",
        output_path.display(),
        result.code_length,
        result.load_address
    );
    ExitCode::SUCCESS
}
