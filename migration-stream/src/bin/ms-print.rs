use anyhow::Result;
use clap::Parser;
use std::fs::File;
use std::io::{self, Read};

use migration::legacy;
use migration::record::{Prologue, RecordKind, RecordReader, WrapperRecordKind};
use tracing_subscriber::filter::EnvFilter;

/// Summarises the records of a converted stream, one line per record.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input file or '-' to use stdin.
    #[arg(short, long, default_value_t = String::from("-"))]
    input: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("MS_LOG"))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let input = open_input(args.input.as_str())?;
    let mut reader = RecordReader::new(input);

    match reader.read_prologue()? {
        Prologue::Raw => {
            println!("image header (raw flavor)");
            print_domain_header(&mut reader)?;
            print_raw_body(&mut reader)?;
            print_device_model_tail(reader)?;
        }
        Prologue::Wrapped(options) => {
            println!("wrapper header (options {:#x})", options.bits());
            loop {
                let record = reader.next_record()?;
                match record.wrapper_kind() {
                    Some(WrapperRecordKind::EmbeddedContext) => {
                        println!("{}", WrapperRecordKind::EmbeddedContext);
                        println!("image header (embedded)");
                        reader.read_image_header()?;
                        print_domain_header(&mut reader)?;
                        print_raw_body(&mut reader)?;
                    }
                    Some(WrapperRecordKind::End) => {
                        println!("{}", WrapperRecordKind::End);
                        break;
                    }
                    Some(kind) => println!("{} ({} bytes)", kind, record.len()),
                    None => println!("unknown record {:#x} ({} bytes)", record.ty(), record.len()),
                }
            }
        }
    }

    Ok(())
}

fn print_domain_header<R: Read>(reader: &mut RecordReader<R>) -> Result<()> {
    let domain = reader.read_domain_header()?;
    println!(
        "domain header: type {} page shift {} version {}.{}",
        domain.dtype, domain.page_shift, domain.xen_major, domain.xen_minor
    );
    Ok(())
}

/// Prints body records up to and including the end-of-body marker.
fn print_raw_body<R: Read>(reader: &mut RecordReader<R>) -> Result<()> {
    loop {
        let record = reader.next_record()?;
        match record.kind() {
            Some(RecordKind::End) => {
                println!("{}", RecordKind::End);
                return Ok(());
            }
            Some(kind) => println!("{} ({} bytes)", kind, record.len()),
            None => println!("unknown record {:#x} ({} bytes)", record.ty(), record.len()),
        }
    }
}

/// A raw-flavor stream may trail off with a legacy-framed device-model
/// blob; anything after the end record that opens with the signature is
/// reported, and a clean end of stream is fine.
fn print_device_model_tail<R: Read>(reader: RecordReader<R>) -> Result<()> {
    let mut src = reader.into_source();
    let mut signature = [0u8; 21];
    if src.read_into(&mut signature).is_err() {
        return Ok(());
    }
    if &signature != legacy::DEVICE_MODEL_SIGNATURE {
        println!("trailing bytes (not a device model blob)");
        return Ok(());
    }
    let len = src.read_u32()?;
    println!("device model blob ({len} bytes, legacy framing)");
    Ok(())
}

fn open_input(input: &str) -> io::Result<Box<dyn Read>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    Ok(Box::new(File::open(input)?))
}
