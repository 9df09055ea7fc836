//! Conversion of legacy domain checkpoint streams into the v2 record format.
//!
//! The legacy save pathway produced an untagged, version-less sequence of
//! chunks whose interpretation depends on state accumulated earlier in the
//! stream. Current restore tooling consumes a tagged, length-prefixed record
//! stream instead. This crate decodes the former and encodes the latter in a
//! single sequential pass, never holding more than one chunk of guest data in
//! memory at a time.
//!
//! The conversion is driven by [`convert::Converter`]; [`record`] holds the
//! typed writers (and a reader) for the v2 format, [`legacy`] the chunk
//! catalogue and literals of the old format, and [`stream`] the byte-level
//! source/sink adapters.

use std::fmt;
use std::io;

pub mod convert;
pub mod legacy;
pub mod record;
pub mod stream;

pub use convert::Converter;

/// Legacy toolstack bitness.
///
/// Every size-dependent field in the legacy stream (the sizing word, page
/// frame numbers, the p2m frame list, discarded unmapped-pfn words) is
/// encoded at this width.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    Bits32,
    Bits64,
}

impl Width {
    /// Bytes per native word at this width.
    pub fn size(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    /// The all-bits-set pattern at this width.
    pub fn ones(self) -> u64 {
        match self {
            Self::Bits32 => 0xffff_ffff,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// Kind of guest captured in the legacy stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuestKind {
    Pv,
    Hvm,
}

/// Output container flavor.
///
/// `Raw` is the bare domain record stream. `Wrapped` adds the toolstack-level
/// container around an embedded raw body: a wrapper header, deferred
/// toolstack data records, a re-framed device-model blob and a closing end
/// record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flavor {
    Raw,
    Wrapped,
}

/// One conversion run's configuration, constructed once by the caller and
/// passed by reference into every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub width: Width,
    pub guest: GuestKind,
    pub flavor: Flavor,
    /// An outer `xl` header is present on the input and must be copied
    /// through ahead of the converted stream.
    pub xl_header: bool,
    /// Relay the trailing device-model blob (HVM only).
    pub relay_device_model: bool,
}

impl Config {
    pub fn wrapped(&self) -> bool {
        self.flavor == Flavor::Wrapped
    }

    pub fn pv(&self) -> bool {
        self.guest == GuestKind::Pv
    }
}

/// The two fatal failure categories of a conversion run.
///
/// There are no recoverable failures: the first error aborts the run and the
/// partial output must be discarded by the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, truncated or semantically invalid input.
    Protocol,
    /// A recognised legacy capability this converter intentionally does not
    /// implement.
    Unsupported,
}

/// Recognised-but-unimplemented legacy capabilities.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Feature {
    CompressedData,
    PageCompression,
    TranscendentMemory,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CompressedData => "compressed page data",
            Self::PageCompression => "page compression",
            Self::TranscendentMemory => "transcendent memory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream truncated")]
    Truncated(#[source] io::Error),

    #[error("failed to write output stream")]
    Sink(#[source] io::Error),

    #[error("unrecognised chunk marker {0}")]
    UnknownChunk(i32),

    #[error("page batch of {0} frames exceeds the batch limit")]
    BatchTooLarge(u32),

    #[error("duplicate frame numbers in page batch")]
    DuplicateFrames,

    #[error("vcpu max id {0} out of range")]
    VcpuIdRange(i32),

    #[error("unexpected extended info marker {0:#x}")]
    ExtendedInfoMarker(u64),

    #[error("unrecognised extended info block {}", String::from_utf8_lossy(.0))]
    UnknownExtendedBlock([u8; 4]),

    #[error("extended info block {} too short", String::from_utf8_lossy(.0))]
    ShortExtendedBlock([u8; 4]),

    #[error("overshot extended info size by {0} bytes")]
    ExtendedInfoOvershoot(u64),

    #[error("cannot size the guest from a vcpu context of {0:#x} bytes")]
    VcpuContextSize(u32),

    #[error("guest width unknown before the p2m frame list")]
    MissingGuestWidth,

    #[error("p2m size of zero")]
    EmptyP2m,

    #[error("hvm parameters found in a pv stream")]
    HvmParamsInPvStream,

    #[error("xsave area of {got:#x} bytes, expected {expected:#x}")]
    XsaveSizeMismatch { expected: u64, got: u64 },

    #[error("no xl header at the start of the stream")]
    MissingXlHeader,

    #[error("unrecognised device model signature {:?}", String::from_utf8_lossy(.0))]
    DeviceModelSignature(Vec<u8>),

    #[error("not a v2 image header")]
    BadImageHeader,

    #[error("not a v2 wrapper header")]
    BadWrapperHeader,

    #[error("unsupported legacy feature: {0}")]
    Unsupported(Feature),
}

impl Error {
    /// The failure category, which decides the process exit status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unsupported(_) => ErrorKind::Unsupported,
            _ => ErrorKind::Protocol,
        }
    }
}
