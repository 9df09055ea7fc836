//! Byte-level source and sink adapters.
//!
//! These carry no format knowledge. Reads are exact-length only (a short
//! read is a truncation error, never a partial result) and writes are
//! unconditional. Back-pressure is whatever the underlying reader/writer
//! provides (a pipe blocking, typically).

use std::io::{BufReader, BufWriter, Read, Write};

use crate::{Error, Width};

/// Buffered byte source with exact-length reads.
#[derive(Debug)]
pub struct StreamSource<R> {
    reader: BufReader<R>,
}

impl<R: Read> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Reads exactly `buf.len()` bytes into `buf`.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.reader.read_exact(buf).map_err(Error::Truncated)
    }

    /// Reads exactly `len` bytes into a fresh buffer.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let mut buf = [0u8; 4];
        self.read_into(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_into(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads one unsigned word at the legacy toolstack width, widened to
    /// `u64`.
    pub fn read_ulong(&mut self, width: Width) -> Result<u64, Error> {
        match width {
            Width::Bits32 => Ok(self.read_u32()? as u64),
            Width::Bits64 => self.read_u64(),
        }
    }

    /// Reads `count` toolstack-width words.
    pub fn read_ulongs(&mut self, width: Width, count: usize) -> Result<Vec<u64>, Error> {
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(self.read_ulong(width)?);
        }
        Ok(words)
    }
}

/// Buffered byte sink.
#[derive(Debug)]
pub struct StreamSink<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).map_err(Error::Sink)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().map_err(Error::Sink)
    }

    /// Flushes and hands back the underlying writer.
    pub fn into_inner(self) -> std::io::Result<W> {
        self.writer.into_inner().map_err(|err| err.into_error())
    }
}
