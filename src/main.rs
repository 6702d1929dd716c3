#![allow(dead_code)]

mod debugger;
mod machine;
mod memory;
mod processor;
mod shell;

use std::{
    error::Error,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::Parser;
use machine::{Machine, RunState};
use processor::Processor;
use shell::{OutputFormat, Shell};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Word = u32;
pub type HalfWord = u16;
pub type Byte = u8;
pub type Address = u32;

pub const fn static_assert(condition: bool) {
    assert!(condition);
}

const _: () = static_assert(HalfWord::SIZE * 2 == Word::SIZE);
const _: () = static_assert(Byte::SIZE * 2 == HalfWord::SIZE);

pub trait Size: Sized {
    const SIZE: usize = std::mem::size_of::<Self>();
}

impl Size for Word {}
impl Size for HalfWord {}
impl Size for Byte {}

/// Runs when no image is given: counts ecx down from 3, then traps with eax = 0.
const DEFAULT_IMAGE: [Byte; 12] = [
    0xB9, 0x03, 0x00, 0x00, 0x00, // mov ecx, 3
    0x49, 0x49, 0x49, // dec ecx (x3)
    0xB0, 0x00, // mov al, 0
    0x90, // nop
    0xD6, // nemu_trap
];

#[derive(Parser, Debug)]
#[clap(name = "nemu_monitor", version, about = "Debugger monitor for a tiny x86 machine")]
struct Cli {
    /// Raw binary loaded at 0x100000 (a built-in demo program if omitted)
    #[clap(value_parser, value_name = "IMAGE")]
    image: Option<PathBuf>,

    /// Run until the program ends instead of opening a prompt
    #[clap(long)]
    batch: bool,

    /// Watch EXPR from the start (may be repeated)
    #[clap(long, value_name = "EXPR")]
    watch: Vec<String>,

    /// Print watchpoint hits and the final report as JSON lines (batch mode)
    #[clap(long)]
    json: bool,

    /// Log filter directive, overridden by RUST_LOG
    #[clap(long, value_name = "FILTER", default_value = "warn")]
    log: String,
}

fn load_image(machine: &mut Machine, filename: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let buffer = std::fs::read(filename.as_ref())?;
    if buffer.is_empty() {
        return Err(format!("{} is empty", filename.as_ref().display()).into());
    }
    machine.memory.load(Processor::ENTRY_POINT, &buffer)?;
    info!(
        image = %filename.as_ref().display(),
        bytes = buffer.len(),
        "image loaded"
    );
    Ok(())
}

fn run_batch<W: Write>(shell: &mut Shell<W>) -> io::Result<()> {
    loop {
        shell.run(None)?;
        if shell.machine.state() != RunState::Stopped {
            return Ok(());
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut machine = Machine::new();
    match &cli.image {
        Some(image) => load_image(&mut machine, image)?,
        None => machine.memory.load(Processor::ENTRY_POINT, &DEFAULT_IMAGE)?,
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let mut shell = Shell::new(machine, io::stdout(), format);
    for expression in &cli.watch {
        if !shell.watch(expression)? {
            return Err(format!("could not set up watchpoint `{}`", expression).into());
        }
    }

    if cli.batch {
        run_batch(&mut shell)?;
    } else {
        shell.run_interactive()?;
    }
    Ok(())
}
