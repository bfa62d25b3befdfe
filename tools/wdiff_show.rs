// Inspect a wdiff file: print its header and records.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use walb::diff::file::DiffReader;

#[derive(Parser, Debug)]
#[command(name = "wdiff-show")]
#[command(about = "Print the header and records of a wdiff file", long_about = None)]
struct Args {
    /// wdiff file to inspect
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Also verify and print payload checksums
    #[arg(short, long)]
    checksums: bool,
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = DiffReader::new(BufReader::new(File::open(&args.file)?));
    let header = reader.read_header()?;
    println!(
        "wdiff uuid {} max_io_blocks {}",
        header.uuid, header.max_io_blocks
    );

    let mut n = 0usize;
    let mut blocks = 0u64;
    while let Some((rec, io)) = reader.read_diff()? {
        let kind = if rec.is_discard() {
            'D'
        } else if rec.is_all_zero() {
            'Z'
        } else {
            'W'
        };
        if args.checksums {
            println!(
                "{kind}\t{}\t{}\tcmpr {}\tsize {}\tcsum {:08x}",
                rec.io_address,
                rec.io_blocks,
                rec.compression_type,
                rec.data_size,
                io.calc_checksum()
            );
        } else {
            println!("{kind}\t{}\t{}", rec.io_address, rec.io_blocks);
        }
        n += 1;
        blocks += rec.io_blocks as u64;
    }
    println!("records {n} blocks {blocks}");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wdiff-show: {e}");
            ExitCode::FAILURE
        }
    }
}
