//! The conversion engine.
//!
//! Decoding the legacy stream and encoding the v2 stream are interleaved:
//! each fact is re-emitted (or buffered on the session state) as soon as it
//! is decoded, so memory use stays bounded by the largest single chunk. The
//! run is strictly single-threaded and blocking; the first failure aborts it
//! and leaves the output truncated and unusable.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::mem;

use crate::legacy::{self, ChunkKind, HvmParamChunk};
use crate::record::{
    DomainHeader, EmbeddedContext, EmulatorContext, End, HvmContext, HvmParams, ImageHeader,
    P2mFrames, PageData, PvInfo, SharedInfo, TscInfo, VcpuBlob, WrapperHeader, XenstoreData,
    XlMandatoryFlags,
};
use crate::stream::{StreamSink, StreamSource};
use crate::{Config, Error, GuestKind};

/// Per-run session state: guest facts discovered incrementally while
/// decoding, which shape records emitted later in the stream.
///
/// Mutated monotonically: a fact, once learned, is never rolled back. The
/// state lives for exactly one run.
#[derive(Debug)]
pub struct Vm {
    /// Total guest physical pages; the first thing the stream declares.
    pub p2m_size: u64,
    /// Bytes per guest native word, inferred from the basic vcpu context
    /// size. Zero until the extended-info block fixes it.
    pub guest_width: usize,
    pub pt_levels: u32,
    pub vcpu_basic_len: usize,
    pub has_extended: bool,
    /// Declared xsave area size; zero when the guest carries no xsave state.
    pub xsave_len: u64,
    pub max_vcpu_id: u32,
    /// Online vcpu ids, ascending. A presence chunk replaces the whole set;
    /// without one, vcpu 0 is online (a guest cannot have no vcpus).
    pub online_vcpus: Vec<u32>,
    /// HVM parameters in contribution order, flushed as one record.
    pub hvm_params: Vec<(u64, u64)>,
    /// Toolstack blobs held for deferred emission (wrapped flavor only).
    pub toolstack_data: Vec<Vec<u8>>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            p2m_size: 0,
            guest_width: 0,
            pt_levels: 0,
            vcpu_basic_len: 0,
            has_extended: false,
            xsave_len: 0,
            max_vcpu_id: 0,
            online_vcpus: vec![0],
            hvm_params: Vec::new(),
            toolstack_data: Vec::new(),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one conversion run from a legacy source to a v2 sink.
#[derive(Debug)]
pub struct Converter<'c, R, W: Write> {
    cfg: &'c Config,
    src: StreamSource<R>,
    sink: StreamSink<W>,
    vm: Vm,
}

impl<'c, R: Read, W: Write> Converter<'c, R, W> {
    pub fn new(cfg: &'c Config, input: R, output: W) -> Self {
        Self {
            cfg,
            src: StreamSource::new(input),
            sink: StreamSink::new(output),
            vm: Vm::new(),
        }
    }

    /// Runs the conversion to completion.
    ///
    /// On error the sink holds a truncated prefix that the caller must
    /// discard; nothing about it is salvageable.
    pub fn run(mut self) -> Result<(), Error> {
        if self.cfg.xl_header {
            self.copy_xl_header()?;
        }

        self.vm.p2m_size = self.src.read_ulong(self.cfg.width)?;
        tracing::info!(pages = self.vm.p2m_size, "guest physical page count");

        if self.cfg.wrapped() {
            WrapperHeader.write(&mut self.sink)?;
            EmbeddedContext.write(&mut self.sink)?;
        }
        ImageHeader.write(&mut self.sink)?;
        DomainHeader::new(self.cfg.guest).write(&mut self.sink)?;

        if self.cfg.pv() {
            self.read_extended_info()?;
            self.read_p2m_frames()?;
        }

        self.read_chunks()?;

        match self.cfg.guest {
            GuestKind::Pv => self.read_pv_tail()?,
            GuestKind::Hvm => self.read_hvm_tail()?,
        }

        if self.cfg.wrapped() {
            self.flush_toolstack_data()?;
        }

        if self.cfg.guest == GuestKind::Hvm
            && (self.cfg.wrapped() || self.cfg.relay_device_model)
        {
            self.read_device_model()?;
        }

        if self.cfg.wrapped() {
            End.write(&mut self.sink)?;
        }

        self.sink.flush()
    }

    /// Copies a pre-existing outer `xl` header through unchanged, except
    /// that re-targeting to the wrapped flavor sets the v2 mandatory flag so
    /// the receiving toolstack knows what body to expect.
    fn copy_xl_header(&mut self) -> Result<(), Error> {
        let mut header = [0u8; 32];
        self.src.read_into(&mut header)?;
        if &header != legacy::XL_HEADER {
            return Err(Error::MissingXlHeader);
        }

        let end = self.src.read_u32()?;
        let mut mandatory = self.src.read_u32()?;
        let optional = self.src.read_u32()?;
        let optlen = self.src.read_u32()?;
        if self.cfg.wrapped() {
            mandatory |= XlMandatoryFlags::STREAM_V2.bits();
        }
        let options = self.src.read_exact(optlen as usize)?;

        self.sink.write_all(&header)?;
        for field in [end, mandatory, optional, optlen] {
            self.sink.write_all(&field.to_le_bytes())?;
        }
        self.sink.write_all(&options)?;
        tracing::debug!(optlen, "copied xl header");
        Ok(())
    }

    /// Decodes the extended-info block of a paravirtualized stream: an
    /// all-ones marker, a total length, then tagged sub-blocks that must
    /// fill the declared length exactly.
    fn read_extended_info(&mut self) -> Result<(), Error> {
        let marker = self.src.read_ulong(self.cfg.width)?;
        if marker != self.cfg.width.ones() {
            return Err(Error::ExtendedInfoMarker(marker));
        }

        let total = self.src.read_u32()? as u64;
        let mut so_far = 0u64;
        tracing::debug!(total, "extended info");

        while so_far < total {
            let mut tag = [0u8; 4];
            self.src.read_into(&mut tag)?;
            let size = self.src.read_u32()?;
            so_far += 8;
            let data = self.src.read_exact(size as usize)?;
            so_far += size as u64;

            match &tag {
                legacy::EXT_BLOCK_VCPU => {
                    let (width, levels) = match size {
                        legacy::VCPU_CTX_SIZE_64 => (8u8, 4u8),
                        legacy::VCPU_CTX_SIZE_32 => (4u8, 3u8),
                        other => return Err(Error::VcpuContextSize(other)),
                    };
                    self.vm.vcpu_basic_len = size as usize;
                    self.vm.guest_width = width as usize;
                    self.vm.pt_levels = levels as u32;
                    tracing::info!(width, levels, "guest sizing");
                    PvInfo::new(width, levels).write(&mut self.sink)?;
                }
                legacy::EXT_BLOCK_EXTV => self.vm.has_extended = true,
                legacy::EXT_BLOCK_XCNT => {
                    let bytes: [u8; 4] = data
                        .get(..4)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(Error::ShortExtendedBlock(tag))?;
                    self.vm.xsave_len = u32::from_le_bytes(bytes) as u64;
                    tracing::info!(len = self.vm.xsave_len, "xsave area size");
                }
                _ => return Err(Error::UnknownExtendedBlock(tag)),
            }
        }

        if so_far != total {
            return Err(Error::ExtendedInfoOvershoot(so_far - total));
        }
        Ok(())
    }

    /// Reads the p2m frame list and re-emits it widened to 64-bit frame
    /// numbers. Requires both the page count and the guest width, so it can
    /// only run after the sizing word and the extended-info block.
    fn read_p2m_frames(&mut self) -> Result<(), Error> {
        if self.vm.guest_width == 0 {
            return Err(Error::MissingGuestWidth);
        }
        if self.vm.p2m_size == 0 {
            return Err(Error::EmptyP2m);
        }

        let fpp = (legacy::PAGE_SIZE / self.vm.guest_width) as u64;
        let count = self.vm.p2m_size.div_ceil(fpp) as usize;
        tracing::debug!(frames_per_page = fpp, frames = count, "p2m frame list");

        let frames = self.src.read_ulongs(self.cfg.width, count)?;
        P2mFrames::new((self.vm.p2m_size - 1) as u32, &frames).write(&mut self.sink)
    }

    /// The chunk-list loop: one signed marker per iteration until the zero
    /// terminator.
    fn read_chunks(&mut self) -> Result<(), Error> {
        loop {
            let marker = self.src.read_i32()?;
            match ChunkKind::try_from(marker)? {
                ChunkKind::End => {
                    // Parameters stay buffered for the HVM tail; a PV
                    // stream has no place to put them.
                    if !self.vm.hvm_params.is_empty() && self.cfg.pv() {
                        return Err(Error::HvmParamsInPvStream);
                    }
                    tracing::debug!("end of chunk list");
                    return Ok(());
                }
                ChunkKind::PageBatch(count) => self.read_page_batch(count)?,
                ChunkKind::VerifyMode => tracing::debug!("verify mode chunk"),
                ChunkKind::LastCheckpoint => tracing::debug!("last checkpoint chunk"),
                ChunkKind::VcpuInfo => self.read_vcpu_info()?,
                ChunkKind::TscInfo => self.read_tsc_info()?,
                ChunkKind::HvmParam(chunk) => self.read_hvm_param(chunk)?,
                ChunkKind::ToolstackData => self.read_toolstack_data()?,
                ChunkKind::Unsupported(feature) => return Err(Error::Unsupported(feature)),
            }
        }
    }

    fn read_page_batch(&mut self, count: u32) -> Result<(), Error> {
        if count > legacy::MAX_BATCH {
            return Err(Error::BatchTooLarge(count));
        }
        let descriptors = self.src.read_ulongs(self.cfg.width, count as usize)?;

        // The legacy save path wrote placeholder descriptors for runs of
        // frames it could not map; they carry nothing worth keeping.
        let pfns: Vec<u64> = descriptors
            .into_iter()
            .filter(|&pfn| pfn != legacy::PFN_UNMAPPED)
            .collect();

        let mut seen = HashSet::with_capacity(pfns.len());
        if !pfns.iter().all(|&pfn| seen.insert(pfn)) {
            return Err(Error::DuplicateFrames);
        }

        let populated = pfns
            .iter()
            .filter(|&&pfn| (pfn & legacy::PFN_TYPE_MASK) < legacy::PFN_NO_DATA)
            .count();
        let contents = self.src.read_exact(populated * legacy::PAGE_SIZE)?;

        tracing::debug!(frames = pfns.len(), populated, "page batch");
        PageData::new(&pfns, &contents).write(&mut self.sink)
    }

    fn read_vcpu_info(&mut self) -> Result<(), Error> {
        let max_id = self.src.read_i32()?;
        if !(0..=legacy::VCPU_MAX_ID).contains(&max_id) {
            return Err(Error::VcpuIdRange(max_id));
        }
        self.vm.max_vcpu_id = max_id as u32;

        let mut words = Vec::with_capacity(max_id as usize / 64 + 1);
        for _ in 0..max_id / 64 + 1 {
            words.push(self.src.read_u64()?);
        }
        self.vm.online_vcpus = legacy::decode_vcpu_bitmap(&words);
        tracing::info!(max_id, online = ?self.vm.online_vcpus, "vcpu presence");
        Ok(())
    }

    fn read_tsc_info(&mut self) -> Result<(), Error> {
        let mode = self.src.read_u32()?;
        let nsec = self.src.read_u64()?;
        let khz = self.src.read_u32()?;
        let incarnation = self.src.read_u32()?;
        tracing::info!(mode, nsec, khz, incarnation, "tsc info");
        TscInfo::new(mode, khz, nsec, incarnation).write(&mut self.sink)
    }

    fn read_hvm_param(&mut self, chunk: HvmParamChunk) -> Result<(), Error> {
        let _reserved = self.src.read_u32()?;
        let value = self.src.read_u64()?;
        tracing::debug!(param = chunk.name(), value, "hvm parameter chunk");
        self.vm.hvm_params.push((chunk.param_index(), value));
        Ok(())
    }

    fn read_toolstack_data(&mut self) -> Result<(), Error> {
        let len = self.src.read_u32()?;
        if len == 0 {
            return Ok(());
        }
        let data = self.src.read_exact(len as usize)?;
        if self.cfg.wrapped() {
            tracing::debug!(len, "buffering toolstack data");
            self.vm.toolstack_data.push(data);
        } else {
            // The raw flavor has nowhere to carry it.
            tracing::debug!(len, "discarding toolstack data");
        }
        Ok(())
    }

    /// Decodes the paravirtualized tail: per-vcpu state blobs in ascending
    /// id order, then the shared-info page.
    fn read_pv_tail(&mut self) -> Result<(), Error> {
        let unmapped = self.src.read_u32()?;
        if unmapped != 0 {
            // Legacy artifact; the listed pfns carry nothing usable.
            let _ = self.src.read_ulongs(self.cfg.width, unmapped as usize)?;
            tracing::warn!(count = unmapped, "discarded bogus unmapped pfns");
        }

        for vcpu_id in self.vm.online_vcpus.clone() {
            let basic = self.src.read_exact(self.vm.vcpu_basic_len)?;
            tracing::debug!(vcpu_id, len = basic.len(), "vcpu basic state");
            VcpuBlob::basic(vcpu_id, &basic).write(&mut self.sink)?;

            if self.vm.has_extended {
                let extended = self.src.read_exact(legacy::VCPU_EXTENDED_LEN)?;
                tracing::debug!(vcpu_id, "vcpu extended state");
                VcpuBlob::extended(vcpu_id, &extended).write(&mut self.sink)?;
            }

            if self.vm.xsave_len != 0 {
                let mask = self.src.read_u64()?;
                let size = self.src.read_u64()?;
                let expected = self.vm.xsave_len.saturating_sub(16);
                if size != expected {
                    return Err(Error::XsaveSizeMismatch {
                        expected,
                        got: size,
                    });
                }
                let xsave = self.src.read_exact(size as usize)?;
                tracing::debug!(vcpu_id, mask, size, "vcpu xsave state");
                VcpuBlob::xsave(vcpu_id, &xsave).write(&mut self.sink)?;
            }
        }

        let shared_info = self.src.read_exact(legacy::PAGE_SIZE)?;
        SharedInfo(&shared_info).write(&mut self.sink)?;
        End.write(&mut self.sink)
    }

    /// Decodes the hardware-virtualized tail: the three magic pfns, the
    /// single flush of every accumulated parameter, then the context blob.
    fn read_hvm_tail(&mut self) -> Result<(), Error> {
        let ioreq = self.src.read_u64()?;
        let bufioreq = self.src.read_u64()?;
        let store = self.src.read_u64()?;
        tracing::info!(ioreq, bufioreq, store, "magic pfns");
        self.vm.hvm_params.extend([
            (legacy::PARAM_IOREQ_PFN, ioreq),
            (legacy::PARAM_BUFIOREQ_PFN, bufioreq),
            (legacy::PARAM_STORE_PFN, store),
        ]);
        HvmParams::new(&self.vm.hvm_params).write(&mut self.sink)?;

        let len = self.src.read_u32()?;
        let context = self.src.read_exact(len as usize)?;
        tracing::debug!(len, "hvm context");
        HvmContext(&context).write(&mut self.sink)?;
        End.write(&mut self.sink)
    }

    /// Relays the trailing device-model blob: re-framed as a wrapper record,
    /// or copied through with its legacy framing intact in the raw flavor.
    fn read_device_model(&mut self) -> Result<(), Error> {
        let mut signature = [0u8; 21];
        self.src.read_into(&mut signature)?;
        if &signature != legacy::DEVICE_MODEL_SIGNATURE {
            return Err(Error::DeviceModelSignature(signature.to_vec()));
        }
        let len = self.src.read_u32()?;
        let blob = self.src.read_exact(len as usize)?;
        tracing::info!(len, "device model state");

        if self.cfg.wrapped() {
            EmulatorContext::new(&blob).write(&mut self.sink)
        } else {
            self.sink.write_all(&signature)?;
            self.sink.write_all(&len.to_le_bytes())?;
            self.sink.write_all(&blob)
        }
    }

    fn flush_toolstack_data(&mut self) -> Result<(), Error> {
        for blob in mem::take(&mut self.vm.toolstack_data) {
            tracing::debug!(len = blob.len(), "toolstack data record");
            XenstoreData(&blob).write(&mut self.sink)?;
        }
        Ok(())
    }
}
