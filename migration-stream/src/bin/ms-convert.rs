use anyhow::Result;
use clap::Parser;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use std::process::ExitCode;

use migration::{Config, Converter, Error, ErrorKind, Flavor, GuestKind, Width};
use tracing_subscriber::filter::EnvFilter;

/// Converts a legacy domain checkpoint stream into the v2 record format.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Legacy input: a file, '-' for stdin, or a decimal fd number.
    #[arg(short, long)]
    input: String,

    /// Converted output: a file, '-' for stdout, or a decimal fd number.
    #[arg(short, long)]
    output: String,

    /// Legacy toolstack bitness.
    #[arg(short, long, value_parser = ["32", "64"])]
    width: String,

    /// Kind of guest in the stream.
    #[arg(short, long, value_parser = ["pv", "hvm"])]
    guest_type: String,

    /// Output container flavor.
    #[arg(short, long, default_value = "raw", value_parser = ["raw", "wrapped"])]
    format: String,

    /// An outer `xl` header is present on the input.
    #[arg(short = 'x', long)]
    xl_header: bool,

    /// Do not relay the trailing device-model blob.
    #[arg(long)]
    skip_device_model: bool,

    /// Summarise stream contents to stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default = if args.verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("MS_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code(&err)
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let cfg = Config {
        width: match args.width.as_str() {
            "32" => Width::Bits32,
            _ => Width::Bits64,
        },
        guest: match args.guest_type.as_str() {
            "pv" => GuestKind::Pv,
            _ => GuestKind::Hvm,
        },
        flavor: match args.format.as_str() {
            "wrapped" => Flavor::Wrapped,
            _ => Flavor::Raw,
        },
        xl_header: args.xl_header,
        relay_device_model: !args.skip_device_model,
    };

    let input = open_input(args.input.as_str())?;
    let output = open_output(args.output.as_str())?;
    Converter::new(&cfg, input, output).run()?;
    Ok(())
}

/// Distinct exit statuses for the two fatal error categories, so the
/// calling toolstack can tell corrupt input from a missing capability.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<Error>() {
        Some(err) if err.kind() == ErrorKind::Unsupported => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

fn open_input(input: &str) -> io::Result<Box<dyn Read>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    if let Ok(fd) = input.parse::<i32>() {
        // The calling toolstack hands over already-open descriptors.
        return Ok(Box::new(unsafe { File::from_raw_fd(fd) }));
    }
    Ok(Box::new(File::open(input)?))
}

fn open_output(output: &str) -> io::Result<Box<dyn Write>> {
    if output == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    if let Ok(fd) = output.parse::<i32>() {
        return Ok(Box::new(unsafe { File::from_raw_fd(fd) }));
    }
    Ok(Box::new(File::create(output)?))
}
