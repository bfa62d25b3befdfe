// Convert a wlog stream (stdin) into a wdiff file (stdout).

use std::io::{self, BufReader, BufWriter};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use walb::config::ToolConfig;
use walb::convert::Converter;

#[derive(Parser, Debug)]
#[command(name = "wlog-to-wdiff")]
#[command(about = "Convert a wlog stream into a wdiff file", long_about = None)]
struct Args {
    /// Maximum logical blocks per output diff record (0 = unlimited)
    #[arg(short = 'x', long = "max-io-blocks")]
    max_io_blocks: Option<u32>,

    /// Verbose messages to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ToolConfig::load_from_env()?;
    let max_io_blocks = args
        .max_io_blocks
        .or(config.convert.as_ref().and_then(|c| c.max_io_blocks))
        .unwrap_or(0);

    let input = BufReader::new(io::stdin().lock());
    let output = BufWriter::new(io::stdout().lock());
    Converter::new(max_io_blocks).convert(input, output)?;
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
            eprintln!("wlog-to-wdiff: {e}");
            ExitCode::FAILURE
        }
    }
}
