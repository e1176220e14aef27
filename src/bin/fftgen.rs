//! Generate an FFT routine and inspect or export it.

use std::fs;
use std::process;

use clap::{Parser, ValueEnum};
use log::info;

use fftjit::core::decompose;
use fftjit::x64::{disasm, X64Backend};
use fftjit::{write_elf, Direction, Generator, Plan, TransformParameters};

#[derive(Parser, Debug)]
#[command(name = "fftgen")]
#[command(about = "Generate split-radix FFT routines for x86-64", long_about = None)]
struct Cli {
    /// Transform size (power of two)
    #[arg(long, value_name = "N")]
    size: usize,
    /// Leaf size (power of two)
    #[arg(long, value_name = "L", default_value_t = 8)]
    leaf: usize,
    /// Generate the inverse transform
    #[arg(long)]
    inverse: bool,
    #[arg(long, value_enum, default_value_t = Dump::None)]
    dump: Dump,
    /// Write an ELF object to this path
    #[arg(long, value_name = "FILE")]
    output: Option<String>,
    /// Symbol name of the routine in the object
    #[arg(long, default_value = "fft_routine")]
    symbol: String,
    /// Print generation statistics
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Dump {
    None,
    Tree,
    Hex,
    Asm,
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let direction = if cli.inverse {
        Direction::Inverse
    } else {
        Direction::Forward
    };

    let mut generator = Generator::new(X64Backend::new()?)?;
    let params = TransformParameters::new(cli.size, cli.leaf)?;
    let capacity = generator.required_capacity(cli.size, cli.leaf);
    let mut plan = Plan::new(params, capacity);

    let routine = generator.generate(&mut plan, cli.size, cli.leaf, direction)?;
    info!(
        "N={} {:?}: {} bytes of {} reserved",
        cli.size, direction, routine.code_len, capacity
    );

    match cli.dump {
        Dump::None => {}
        Dump::Tree => {
            for node in decompose::elaborate(cli.size, cli.leaf) {
                println!("{:>8} @ {}", node.size, node.offset);
            }
        }
        Dump::Hex => {
            print!("{}", disasm::hex_dump(routine.code(plan.region()), routine.entry_address - routine.entry_offset));
        }
        Dump::Asm => {
            let base = (routine.entry_address - routine.entry_offset) as u64;
            print!("{}", disasm::listing(plan.region(), &routine, base));
        }
    }

    if let Some(path) = &cli.output {
        let object = write_elf(plan.region(), &routine, &cli.symbol)?;
        fs::write(path, object)?;
        println!("wrote {} ({} bytes of code)", path, routine.code_len);
        println!("sign mask {:#010x?}", routine.sign_mask);
    }

    if cli.stats {
        print!("{}", generator.stats());
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("Error: {error}");
        process::exit(1);
    }
}
