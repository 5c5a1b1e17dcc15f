//! Emit a textual LIR unit and print the annotated result.
//!
//! Options default to the `LIR_EMIT_*` environment variables; flags given
//! on the command line override them.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use clap::Parser;
use log::info;

use lir_emit::core::{DumpLevel, EmitOptions};
use lir_emit::lir_text::parse_lir;
use lir_emit::x64::disasm::disassemble;
use lir_emit::x64::X64Backend;

#[derive(Parser, Debug)]
#[command(name = "lir-emit", about = "Emit x86-64 code for a textual LIR unit")]
struct Args {
    /// Input file; standard input when omitted.
    input: Option<PathBuf>,

    /// Interleave block and instruction comments with the code.
    #[arg(long)]
    print_lir: bool,

    /// none, basic, info or verbose.
    #[arg(long)]
    dump_level: Option<DumpLevel>,

    /// Poison the reserved frame in the prologue.
    #[arg(long)]
    zap_stack: bool,

    /// Emit int3 where control can never arrive.
    #[arg(long)]
    trap_dead_ends: bool,

    /// Alignment of loop headers not reached by fallthrough.
    #[arg(long)]
    loop_align: Option<u32>,

    /// Print per-block offsets and successor probabilities as CSV.
    #[arg(long)]
    block_info: bool,

    /// Skip decoding each instruction after it is emitted.
    #[arg(long)]
    no_verify: bool,

    /// Print the code and data image as hex instead of disassembly.
    #[arg(long)]
    hex: bool,
}

impl Args {
    fn options(&self) -> EmitOptions {
        let mut options = EmitOptions::from_env();
        if self.print_lir {
            options = options.with_print_lir_with_assembly(true);
        }
        if let Some(level) = self.dump_level {
            options = options.with_dump_level(level);
        }
        if self.zap_stack {
            options = options.with_zap_stack(true);
        }
        if self.trap_dead_ends {
            options = options.with_trap_dead_ends(true);
        }
        if let Some(alignment) = self.loop_align {
            options = options.with_loop_header_alignment(alignment);
        }
        if self.block_info {
            options = options.with_block_info(true);
        }
        options
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if let Some(alignment) = args.loop_align {
        if !alignment.is_power_of_two() {
            return Err(format!("--loop-align {alignment} is not a power of two").into());
        }
    }

    let text = match &args.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let unit = parse_lir(&text)?;
    let options = args.options();
    let print_block_info = options.print_block_info;
    let backend = X64Backend::new(options).with_verification(!args.no_verify);
    let result = unit.emit(&backend)?;
    info!(
        "{}: {} bytes code, {} calls, {} marks",
        result.name(),
        result.code_size(),
        result.calls().len(),
        result.marks().len()
    );

    if args.hex {
        for line in result.image().chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
            println!("{}", hex.join(" "));
        }
    } else {
        print!("{}", disassemble(&result));
    }

    if print_block_info {
        print!("{}", result.block_info_csv());
    }
    Ok(())
}
