// Redo a wlog onto a block device.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use walb::config::ToolConfig;
use walb::constants::DEFAULT_REDO_BUFFER_SIZE;
use walb::device::BlockDevice;
use walb::redo::{DiscardMode, LogApplier};
use walb::WalbError;

#[derive(Parser, Debug)]
#[command(name = "wlog-redo")]
#[command(about = "Redo a wlog on a block device", long_about = None)]
struct Args {
    /// Input wlog path, '-' for stdin
    #[arg(short, long, value_name = "PATH", default_value = "-")]
    input: String,

    /// Target device path
    #[arg(value_name = "DEVICE_PATH")]
    device: PathBuf,

    /// Issue device discards for discard logs
    #[arg(short = 'd', long)]
    discard: bool,

    /// Zero-clear the range of discard logs
    #[arg(short = 'z', long = "zero-discard")]
    zero_discard: bool,

    /// Open the device without O_DIRECT (for regular files)
    #[arg(long = "no-direct")]
    no_direct: bool,

    /// Verbose messages to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn discard_mode(args: &Args, config: &ToolConfig) -> Result<DiscardMode, Box<dyn std::error::Error>> {
    if args.discard && args.zero_discard {
        return Err(Box::new(WalbError::Arg(
            "do not specify both -d and -z together".into(),
        )));
    }
    if args.discard {
        return Ok(DiscardMode::Issue);
    }
    if args.zero_discard {
        return Ok(DiscardMode::Zero);
    }
    Ok(config.discard_mode()?.unwrap_or_default())
}

fn open_device(args: &Args) -> Result<BlockDevice, WalbError> {
    if args.no_direct {
        return BlockDevice::open(&args.device, false);
    }
    match BlockDevice::open(&args.device, true) {
        Ok(bd) => Ok(bd),
        Err(WalbError::Io(e)) if e.raw_os_error() == Some(libc::EINVAL) => {
            // Filesystems without O_DIRECT support (e.g. tmpfs).
            warn!("O_DIRECT unsupported on this target, falling back to buffered I/O");
            BlockDevice::open(&args.device, false)
        }
        Err(e) => Err(e),
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ToolConfig::load_from_env()?;
    let mode = discard_mode(args, &config)?;
    let buffer_size = config
        .redo
        .as_ref()
        .and_then(|r| r.buffer_size)
        .unwrap_or(DEFAULT_REDO_BUFFER_SIZE);

    let bd = open_device(args)?;
    let mut applier = LogApplier::new(bd, buffer_size, mode)?;

    let stats = if args.input == "-" {
        applier.apply(BufReader::new(io::stdin().lock()))?
    } else {
        let file: Box<dyn Read> = Box::new(File::open(&args.input)?);
        applier.apply(BufReader::new(file))?
    };
    println!("{stats}");
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
            eprintln!("wlog-redo: {e}");
            ExitCode::FAILURE
        }
    }
}
