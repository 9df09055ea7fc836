//! Typed writers (and a reader) for the v2 record stream.
//!
//! Every record is independently parseable: an 8-byte little-endian header
//! carrying a type and the unpadded payload length, the payload, then zero
//! padding out to the next 8-byte boundary. The raw stream opens with an
//! image header and a domain header; the wrapped flavor puts its own header
//! and record space around an embedded raw body.
//!
//! The image and wrapper headers are packed big-endian: they are the
//! endian-neutral prologue that declares the byte order of everything after
//! them. All subsequent fields are little-endian.

use std::io::{Read, Write};

use crate::stream::{StreamSink, StreamSource};
use crate::{Error, Flavor, GuestKind};

/// Marker opening the image header; all bits set in either byte order.
pub const IMAGE_MARKER: u64 = u64::MAX;

/// Image header identifier, the bytes `XENF` on the wire.
pub const IMAGE_IDENT: u32 = 0x5845_4e46;

pub const IMAGE_VERSION: u32 = 2;

/// Wrapper header identifier, the bytes `LibxlFmt` on the wire.
pub const WRAPPER_IDENT: u64 = 0x4c69_6278_6c46_6d74;

pub const WRAPPER_VERSION: u32 = 2;

/// Version of this converter, carried in the domain header's minor field.
/// A major of zero marks the stream as converted from a legacy source.
pub const CONVERTER_VERSION: u32 = 1;

bitflags::bitflags! {
    /// Options field of the image header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ImageOptions: u16 {
        const BIG_ENDIAN = 1 << 0;
    }

    /// Options field of the wrapper header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct WrapperOptions: u32 {
        const BIG_ENDIAN = 1 << 0;
        const LEGACY = 1 << 1;
    }

    /// Mandatory-flags field of the outer `xl` header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct XlMandatoryFlags: u32 {
        const STREAM_V2 = 1 << 1;
    }
}

/// Record types of the raw domain stream.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    End = 0,
    PageData = 1,
    PvInfo = 2,
    PvP2mFrames = 3,
    PvVcpuBasic = 4,
    PvVcpuExtended = 5,
    PvVcpuXsave = 6,
    SharedInfo = 7,
    TscInfo = 8,
    HvmContext = 9,
    HvmParams = 10,
}

impl RecordKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::End,
            1 => Self::PageData,
            2 => Self::PvInfo,
            3 => Self::PvP2mFrames,
            4 => Self::PvVcpuBasic,
            5 => Self::PvVcpuExtended,
            6 => Self::PvVcpuXsave,
            7 => Self::SharedInfo,
            8 => Self::TscInfo,
            9 => Self::HvmContext,
            10 => Self::HvmParams,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Record types of the wrapper stream.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WrapperRecordKind {
    End = 0,
    EmbeddedContext = 1,
    XenstoreData = 2,
    EmulatorContext = 3,
}

impl WrapperRecordKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::End,
            1 => Self::EmbeddedContext,
            2 => Self::XenstoreData,
            3 => Self::EmulatorContext,
            _ => return None,
        })
    }
}

impl std::fmt::Display for WrapperRecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Zero padding that follows a payload of `len` bytes.
pub fn pad_len(len: usize) -> usize {
    (8 - (len & 7)) & 7
}

const PADDING: [u8; 7] = [0; 7];

/// Writes one framed record: header, payload parts, padding.
fn write_record<W: Write>(
    sink: &mut StreamSink<W>,
    ty: u32,
    parts: &[&[u8]],
) -> Result<(), Error> {
    let length: usize = parts.iter().map(|part| part.len()).sum();
    sink.write_all(&ty.to_le_bytes())?;
    sink.write_all(&(length as u32).to_le_bytes())?;
    for part in parts {
        sink.write_all(part)?;
    }
    sink.write_all(&PADDING[..pad_len(length)])
}

/// Image header of the raw stream.
///
/// # Format
///
/// `| marker: be64 | ident: be32 | version: be32 | options: be16 | reserved: u16 | reserved: u32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageHeader;

impl ImageHeader {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        sink.write_all(&IMAGE_MARKER.to_be_bytes())?;
        sink.write_all(&IMAGE_IDENT.to_be_bytes())?;
        sink.write_all(&IMAGE_VERSION.to_be_bytes())?;
        sink.write_all(&ImageOptions::empty().bits().to_be_bytes())?;
        sink.write_all(&[0u8; 2])?;
        sink.write_all(&[0u8; 4])
    }
}

/// Domain header of the raw stream.
///
/// # Format
///
/// `| type: u32 | page_shift: u16 | reserved: u16 | major: u32 | minor: u32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHeader {
    guest: GuestKind,
}

impl DomainHeader {
    pub fn new(guest: GuestKind) -> Self {
        Self { guest }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let dtype: u32 = match self.guest {
            GuestKind::Pv => 1,
            GuestKind::Hvm => 2,
        };
        sink.write_all(&dtype.to_le_bytes())?;
        sink.write_all(&12u16.to_le_bytes())?; // page size order
        sink.write_all(&[0u8; 2])?;
        sink.write_all(&0u32.to_le_bytes())?;
        sink.write_all(&CONVERTER_VERSION.to_le_bytes())
    }
}

/// Header of the wrapped flavor, marked little-endian and legacy.
///
/// # Format
///
/// `| ident: be64 | version: be32 | options: be32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WrapperHeader;

impl WrapperHeader {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        sink.write_all(&WRAPPER_IDENT.to_be_bytes())?;
        sink.write_all(&WRAPPER_VERSION.to_be_bytes())?;
        sink.write_all(&WrapperOptions::LEGACY.bits().to_be_bytes())
    }
}

/// Guest sizing information for a paravirtualized domain.
///
/// # Format
///
/// `| guest_width: u8 | pt_levels: u8 | reserved: u16 | reserved: u32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PvInfo {
    width: u8,
    levels: u8,
}

impl PvInfo {
    pub fn new(width: u8, levels: u8) -> Self {
        Self { width, levels }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let payload = [self.width, self.levels, 0, 0, 0, 0, 0, 0];
        write_record(sink, RecordKind::PvInfo as u32, &[&payload])
    }
}

/// Frames backing the guest's p2m table.
///
/// # Format
///
/// `| start_pfn: u32 | end_pfn: u32 | frames: [u64] |`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2mFrames<'d> {
    end_pfn: u32,
    frames: &'d [u64],
}

impl<'d> P2mFrames<'d> {
    pub fn new(end_pfn: u32, frames: &'d [u64]) -> Self {
        Self { end_pfn, frames }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let mut header = [0u8; 8];
        header[4..8].copy_from_slice(&self.end_pfn.to_le_bytes());
        let mut frames = Vec::with_capacity(self.frames.len() * 8);
        for frame in self.frames {
            frames.extend_from_slice(&frame.to_le_bytes());
        }
        write_record(sink, RecordKind::PvP2mFrames as u32, &[&header, &frames])
    }
}

/// One batch of guest pages.
///
/// Legacy frame descriptors keep the type nibble in bits 28-31; the v2
/// format keeps it in bits 60-63. The relocation happens here so callers
/// hand over descriptors exactly as read.
///
/// # Format
///
/// `| count: u32 | reserved: u32 | pfns: [u64; count] | contents: [u8] |`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData<'d> {
    pfns: &'d [u64],
    contents: &'d [u8],
}

impl<'d> PageData<'d> {
    pub fn new(pfns: &'d [u64], contents: &'d [u8]) -> Self {
        Self { pfns, contents }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&(self.pfns.len() as u32).to_le_bytes());
        let mut pfns = Vec::with_capacity(self.pfns.len() * 8);
        for pfn in self.pfns {
            let relocated = ((pfn & 0xf000_0000) << 32) | (pfn & 0x0fff_ffff);
            pfns.extend_from_slice(&relocated.to_le_bytes());
        }
        write_record(
            sink,
            RecordKind::PageData as u32,
            &[&header, &pfns, self.contents],
        )
    }
}

/// An opaque per-vcpu state blob: basic, extended or xsave.
///
/// # Format
///
/// `| vcpu_id: u32 | reserved: u32 | data: [u8] |`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuBlob<'d> {
    kind: RecordKind,
    vcpu_id: u32,
    data: &'d [u8],
}

impl<'d> VcpuBlob<'d> {
    pub fn basic(vcpu_id: u32, data: &'d [u8]) -> Self {
        Self {
            kind: RecordKind::PvVcpuBasic,
            vcpu_id,
            data,
        }
    }

    pub fn extended(vcpu_id: u32, data: &'d [u8]) -> Self {
        Self {
            kind: RecordKind::PvVcpuExtended,
            vcpu_id,
            data,
        }
    }

    pub fn xsave(vcpu_id: u32, data: &'d [u8]) -> Self {
        Self {
            kind: RecordKind::PvVcpuXsave,
            vcpu_id,
            data,
        }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&self.vcpu_id.to_le_bytes());
        write_record(sink, self.kind as u32, &[&header, self.data])
    }
}

/// The guest's 4096-byte shared-info page, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedInfo<'d>(pub &'d [u8]);

impl SharedInfo<'_> {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        write_record(sink, RecordKind::SharedInfo as u32, &[self.0])
    }
}

/// Timestamp-counter state.
///
/// # Format
///
/// `| mode: u32 | khz: u32 | nsec: u64 | incarnation: u32 | reserved: u32 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TscInfo {
    mode: u32,
    khz: u32,
    nsec: u64,
    incarnation: u32,
}

impl TscInfo {
    pub fn new(mode: u32, khz: u32, nsec: u64, incarnation: u32) -> Self {
        Self {
            mode,
            khz,
            nsec,
            incarnation,
        }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let mut payload = [0u8; 24];
        payload[..4].copy_from_slice(&self.mode.to_le_bytes());
        payload[4..8].copy_from_slice(&self.khz.to_le_bytes());
        payload[8..16].copy_from_slice(&self.nsec.to_le_bytes());
        payload[16..20].copy_from_slice(&self.incarnation.to_le_bytes());
        write_record(sink, RecordKind::TscInfo as u32, &[&payload])
    }
}

/// The run's accumulated HVM parameters, exactly one record per stream.
///
/// # Format
///
/// `| count: u32 | padding: u32 | entries: [(index: u64, value: u64); count] |`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvmParams<'d> {
    entries: &'d [(u64, u64)],
}

impl<'d> HvmParams<'d> {
    pub fn new(entries: &'d [(u64, u64)]) -> Self {
        Self { entries }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        let mut entries = Vec::with_capacity(self.entries.len() * 16);
        for (index, value) in self.entries {
            entries.extend_from_slice(&index.to_le_bytes());
            entries.extend_from_slice(&value.to_le_bytes());
        }
        write_record(sink, RecordKind::HvmParams as u32, &[&header, &entries])
    }
}

/// The opaque HVM context blob from the legacy tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvmContext<'d>(pub &'d [u8]);

impl HvmContext<'_> {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        write_record(sink, RecordKind::HvmContext as u32, &[self.0])
    }
}

/// Zero-length end-of-body marker. The raw and wrapper record spaces share
/// the type value, so the same record closes both.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct End;

impl End {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        write_record(sink, RecordKind::End as u32, &[])
    }
}

/// Zero-length wrapper record announcing that an embedded raw body follows.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EmbeddedContext;

impl EmbeddedContext {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        write_record(sink, WrapperRecordKind::EmbeddedContext as u32, &[])
    }
}

/// One buffered toolstack blob, re-emitted in arrival order after the
/// embedded raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XenstoreData<'d>(pub &'d [u8]);

impl XenstoreData<'_> {
    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        write_record(sink, WrapperRecordKind::XenstoreData as u32, &[self.0])
    }
}

/// Device-model state re-framed as a wrapper record.
///
/// # Format
///
/// `| emulator_id: u32 | index: u32 | blob: [u8] |`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorContext<'d> {
    blob: &'d [u8],
}

impl<'d> EmulatorContext<'d> {
    pub fn new(blob: &'d [u8]) -> Self {
        Self { blob }
    }

    pub fn write<W: Write>(&self, sink: &mut StreamSink<W>) -> Result<(), Error> {
        // Emulator id zero: unknown. The legacy stream never says which
        // device model produced the blob.
        let header = [0u8; 8];
        write_record(
            sink,
            WrapperRecordKind::EmulatorContext as u32,
            &[&header, self.blob],
        )
    }
}

/// What the stream prologue turned out to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Prologue {
    Raw,
    Wrapped(WrapperOptions),
}

impl Prologue {
    pub fn flavor(&self) -> Flavor {
        match self {
            Self::Raw => Flavor::Raw,
            Self::Wrapped(_) => Flavor::Wrapped,
        }
    }
}

/// Domain header fields as read back from a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub dtype: u32,
    pub page_shift: u16,
    pub xen_major: u32,
    pub xen_minor: u32,
}

/// One record read back from a stream, header plus unpadded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    ty: u32,
    payload: Vec<u8>,
}

impl StreamRecord {
    pub fn ty(&self) -> u32 {
        self.ty
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_u32(self.ty)
    }

    pub fn wrapper_kind(&self) -> Option<WrapperRecordKind> {
        WrapperRecordKind::from_u32(self.ty)
    }
}

/// Sequential reader over a converted stream, for inspection and tests.
#[derive(Debug)]
pub struct RecordReader<R> {
    src: StreamSource<R>,
}

impl<R: Read> RecordReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            src: StreamSource::new(input),
        }
    }

    fn read_be32(&mut self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.src.read_into(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_be64(&mut self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.src.read_into(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads the stream prologue, deciding the flavor from the first eight
    /// bytes: the all-ones image marker, or the wrapper identifier.
    pub fn read_prologue(&mut self) -> Result<Prologue, Error> {
        match self.read_be64()? {
            IMAGE_MARKER => {
                self.finish_image_header()?;
                Ok(Prologue::Raw)
            }
            WRAPPER_IDENT => {
                if self.read_be32()? != WRAPPER_VERSION {
                    return Err(Error::BadWrapperHeader);
                }
                let options =
                    WrapperOptions::from_bits_retain(self.read_be32()?);
                Ok(Prologue::Wrapped(options))
            }
            _ => Err(Error::BadImageHeader),
        }
    }

    /// Reads a full image header, e.g. the embedded one announced by an
    /// embedded-context record inside a wrapped stream.
    pub fn read_image_header(&mut self) -> Result<(), Error> {
        if self.read_be64()? != IMAGE_MARKER {
            return Err(Error::BadImageHeader);
        }
        self.finish_image_header()
    }

    fn finish_image_header(&mut self) -> Result<(), Error> {
        if self.read_be32()? != IMAGE_IDENT || self.read_be32()? != IMAGE_VERSION {
            return Err(Error::BadImageHeader);
        }
        let mut reserved = [0u8; 8]; // options + reserved fields
        self.src.read_into(&mut reserved)?;
        Ok(())
    }

    pub fn read_domain_header(&mut self) -> Result<DomainInfo, Error> {
        let dtype = self.src.read_u32()?;
        let page_shift = self.src.read_u32()? as u16; // low half; high half reserved
        let xen_major = self.src.read_u32()?;
        let xen_minor = self.src.read_u32()?;
        Ok(DomainInfo {
            dtype,
            page_shift,
            xen_major,
            xen_minor,
        })
    }

    /// Reads the next framed record, consuming its padding.
    pub fn next_record(&mut self) -> Result<StreamRecord, Error> {
        let ty = self.src.read_u32()?;
        let length = self.src.read_u32()? as usize;
        let payload = self.src.read_exact(length)?;
        let mut pad = [0u8; 7];
        self.src.read_into(&mut pad[..pad_len(length)])?;
        Ok(StreamRecord { ty, payload })
    }

    /// Hands the underlying source back, e.g. to pick up a trailing
    /// legacy-framed device-model blob after the records stop.
    pub fn into_source(self) -> StreamSource<R> {
        self.src
    }
}
