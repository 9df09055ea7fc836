//! Vocabulary of the legacy checkpoint format.
//!
//! The legacy stream is a version-less sequence of chunks, each introduced by
//! a signed 4-byte marker. The catalogue of markers is closed; anything
//! outside it is a corrupt or newer-than-supported stream and fails the run.

use crate::{Error, Feature};

/// Guest page size. The legacy format hardcodes 4KiB pages.
pub const PAGE_SIZE: usize = 4096;

/// Most frames one page batch may carry.
pub const MAX_BATCH: u32 = 1024;

/// Mask of the type nibble packed into bits 28-31 of a legacy page frame
/// descriptor.
pub const PFN_TYPE_MASK: u64 = 0xf000_0000;

/// Descriptor value the legacy save path wrote for frames it could not map.
/// These carry no page contents and are dropped during conversion.
pub const PFN_UNMAPPED: u64 = 0xf000_0000;

/// Smallest type nibble that marks a frame as having no page contents in the
/// stream.
pub const PFN_NO_DATA: u64 = 0xd000_0000;

/// Largest valid vcpu id a presence chunk may declare.
pub const VCPU_MAX_ID: i32 = 4095;

/// Basic vcpu context sizes, from which the guest's width and page-table
/// depth are inferred. Any other size is unusable.
pub const VCPU_CTX_SIZE_64: u32 = 0x1430;
pub const VCPU_CTX_SIZE_32: u32 = 0xaf0;

/// Size of the extended vcpu state blob in the tail.
pub const VCPU_EXTENDED_LEN: usize = 128;

/// Extended-info block tags.
pub const EXT_BLOCK_VCPU: &[u8; 4] = b"vcpu";
pub const EXT_BLOCK_EXTV: &[u8; 4] = b"extv";
pub const EXT_BLOCK_XCNT: &[u8; 4] = b"xcnt";

/// The 32-byte outer header the `xl` toolstack prepends to saved domains.
pub const XL_HEADER: &[u8; 32] = b"Xen saved domain, xl format\n \0 \r";

/// Signature framing the trailing device-model state blob.
pub const DEVICE_MODEL_SIGNATURE: &[u8; 21] = b"DeviceModelRecord0002";

/// Parameter indices for the three magic pfns read from the HVM tail.
pub const PARAM_STORE_PFN: u64 = 1;
pub const PARAM_IOREQ_PFN: u64 = 5;
pub const PARAM_BUFIOREQ_PFN: u64 = 6;

/// Control chunks that each carry a single HVM parameter value.
///
/// The chunk payload is always `| reserved: u32 | value: u64 |`; the chunk
/// kind alone decides which parameter index the value lands under in the
/// converted stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HvmParamChunk {
    IdentPt,
    Vm86Tss,
    ConsolePfn,
    Viridian,
    AcpiIoports,
    GenerationIdAddr,
    PagingRingPfn,
    AccessRingPfn,
    SharingRingPfn,
    IoreqServerPfn,
    NrIoreqServerPages,
}

impl HvmParamChunk {
    /// The fixed parameter index this chunk contributes to.
    pub fn param_index(self) -> u64 {
        match self {
            Self::IdentPt => 12,
            Self::Vm86Tss => 15,
            Self::ConsolePfn => 17,
            Self::Viridian => 9,
            Self::AcpiIoports => 19,
            Self::GenerationIdAddr => 34,
            Self::PagingRingPfn => 27,
            Self::AccessRingPfn => 28,
            Self::SharingRingPfn => 29,
            Self::IoreqServerPfn => 32,
            Self::NrIoreqServerPages => 33,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::IdentPt => "ident pt",
            Self::Vm86Tss => "vm86 tss",
            Self::ConsolePfn => "console pfn",
            Self::Viridian => "viridian",
            Self::AcpiIoports => "acpi ioports location",
            Self::GenerationIdAddr => "generation id addr",
            Self::PagingRingPfn => "paging ring pfn",
            Self::AccessRingPfn => "access ring pfn",
            Self::SharingRingPfn => "sharing ring pfn",
            Self::IoreqServerPfn => "ioreq server pfn",
            Self::NrIoreqServerPages => "nr ioreq server pages",
        }
    }
}

/// One entry of the legacy chunk catalogue.
///
/// Positive markers are page batches of that many frames; zero terminates
/// the chunk list; the negative space is a closed set of control chunks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkKind {
    PageBatch(u32),
    End,
    VerifyMode,
    VcpuInfo,
    TscInfo,
    LastCheckpoint,
    HvmParam(HvmParamChunk),
    ToolstackData,
    /// Recognised but unimplemented; fails the run.
    Unsupported(Feature),
}

impl TryFrom<i32> for ChunkKind {
    type Error = Error;

    fn try_from(marker: i32) -> Result<Self, Error> {
        Ok(match marker {
            0 => Self::End,
            n if n > 0 => Self::PageBatch(n as u32),
            -1 => Self::VerifyMode,
            -2 => Self::VcpuInfo,
            -3 => Self::HvmParam(HvmParamChunk::IdentPt),
            -4 => Self::HvmParam(HvmParamChunk::Vm86Tss),
            -5 | -6 => Self::Unsupported(Feature::TranscendentMemory),
            -7 => Self::TscInfo,
            -8 => Self::HvmParam(HvmParamChunk::ConsolePfn),
            -9 => Self::LastCheckpoint,
            -10 => Self::HvmParam(HvmParamChunk::AcpiIoports),
            -11 => Self::HvmParam(HvmParamChunk::Viridian),
            -12 => Self::Unsupported(Feature::CompressedData),
            -13 => Self::Unsupported(Feature::PageCompression),
            -14 => Self::HvmParam(HvmParamChunk::GenerationIdAddr),
            -15 => Self::HvmParam(HvmParamChunk::PagingRingPfn),
            -16 => Self::HvmParam(HvmParamChunk::AccessRingPfn),
            -17 => Self::HvmParam(HvmParamChunk::SharingRingPfn),
            -18 => Self::ToolstackData,
            -19 => Self::HvmParam(HvmParamChunk::IoreqServerPfn),
            -20 => Self::HvmParam(HvmParamChunk::NrIoreqServerPages),
            n => return Err(Error::UnknownChunk(n)),
        })
    }
}

/// Expands a vcpu presence bitmap into the online vcpu ids, ascending.
///
/// Bit `i` of word `w` marks id `w * 64 + i` online.
pub fn decode_vcpu_bitmap(words: &[u64]) -> Vec<u32> {
    let mut online = Vec::new();
    for (idx, mut word) in words.iter().copied().enumerate() {
        let mut bit = 0u32;
        while word > 0 {
            if word & 1 != 0 {
                online.push(idx as u32 * 64 + bit);
            }
            bit += 1;
            word >>= 1;
        }
    }
    online
}
