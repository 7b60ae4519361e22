mod budget;
mod elf;
mod error;
mod writer;

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, info};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use writer::CoredumpWriter;

/// Reduces a raw kernel core dump for crash reporting: strips segments backed
/// by on-disk files and reconstructs the process's auxv and maps.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// raw core dump to read; stdin when omitted (the kernel's core_pattern
    /// pipe handler gets the dump on stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// path for the reduced core file (must not already exist)
    coredump: PathBuf,

    /// directory where the auxv and maps side files are created
    proc_files_dir: PathBuf,

    /// log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(level)
        .env()
        .init()
        .context("failed to init logger")?;

    let source: Box<dyn Read> = match &cli.input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("couldn't open {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let writer = CoredumpWriter::new(source, cli.coredump.clone(), cli.proc_files_dir);
    let size = writer
        .write()
        .with_context(|| format!("couldn't write {}", cli.coredump.display()))?;
    info!("done, {size} bytes");
    Ok(())
}
