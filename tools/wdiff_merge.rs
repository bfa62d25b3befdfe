// Merge an ordered chain of wdiff files into one.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use walb::config::ToolConfig;
use walb::merge::DiffMerger;

#[derive(Parser, Debug)]
#[command(name = "wdiff-merge")]
#[command(about = "Merge wdiff files, oldest first", long_about = None)]
struct Args {
    /// Output wdiff path
    #[arg(short, long, value_name = "OUT")]
    output: PathBuf,

    /// Input wdiff paths, chronologically oldest first
    #[arg(value_name = "IN", required = true)]
    inputs: Vec<PathBuf>,

    /// Maximum logical blocks per output diff record (0 = unlimited)
    #[arg(short = 'x', long = "max-io-blocks")]
    max_io_blocks: Option<u32>,

    /// Require all input UUIDs to match
    #[arg(long = "check-uuid")]
    check_uuid: bool,

    /// Verbose messages to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ToolConfig::load_from_env()?;
    let merge_cfg = config.merge.unwrap_or_default();
    let max_io_blocks = args
        .max_io_blocks
        .or(merge_cfg.max_io_blocks)
        .unwrap_or(0);

    let mut merger = match merge_cfg.search_len {
        Some(len) => DiffMerger::with_search_len(len),
        None => DiffMerger::new(),
    };
    merger.set_max_io_blocks(max_io_blocks);
    merger.set_should_validate_uuid(args.check_uuid);
    for path in &args.inputs {
        merger.add_wdiff(BufReader::new(File::open(path)?))?;
    }
    let out = BufWriter::new(File::create(&args.output)?);
    merger.merge_to(out)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wdiff-merge: {e}");
            ExitCode::FAILURE
        }
    }
}
