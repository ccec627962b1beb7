//! Fixed-size NVMe submission and completion entries.
//!
//! Entries are kept as raw little-endian byte arrays so a decoded capsule
//! reproduces the original entry bit for bit; accessors cover the fields
//! the transport reads or rewrites.

/// Submission queue entry size.
pub const SQE_SIZE: usize = 64;

/// Completion queue entry size.
pub const CQE_SIZE: usize = 16;

/// PSDT = 01b: data pointer is an SGL.
const PSDT_SGL: u8 = 0x40;

/// SGL descriptor type: data block, offset addressing (in-capsule data).
pub const SGL_DATA_BLOCK_OFFSET: u8 = 0x01;

/// SGL descriptor type: transport data block (data moved by R2T/Data PDUs).
pub const SGL_TRANSPORT_DATA_BLOCK: u8 = 0x5a;

/// NVM command set opcodes used by the transport and its tests.
pub mod opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

/// Status field values (status code type in bits 10:8, status code in 7:0).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const INVALID_OPCODE: u16 = 0x0001;
    pub const DATA_TRANSFER_ERROR: u16 = 0x0004;
    pub const DATA_SGL_LENGTH_INVALID: u16 = 0x000f;
    pub const ABORTED_SQ_DELETION: u16 = 0x0008;
    pub const TRANSIENT_TRANSPORT_ERROR: u16 = 0x0022;
}

/// Direction of a command's data, from the low two opcode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    HostToController,
    ControllerToHost,
    Bidirectional,
}

/// One 64-byte submission queue entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SubmissionEntry([u8; SQE_SIZE]);

impl SubmissionEntry {
    /// Zeroed entry with the given opcode and command identifier.
    pub fn new(opcode: u8, cid: u16) -> Self {
        let mut raw = [0u8; SQE_SIZE];
        raw[0] = opcode;
        raw[1] = PSDT_SGL;
        raw[2..4].copy_from_slice(&cid.to_le_bytes());
        Self(raw)
    }

    pub fn from_bytes(raw: [u8; SQE_SIZE]) -> Self {
        Self(raw)
    }

    /// Copy from a slice of at least [`SQE_SIZE`] bytes.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; SQE_SIZE] = raw.get(..SQE_SIZE)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SQE_SIZE] {
        &self.0
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    pub fn cid(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.0[2..4].copy_from_slice(&cid.to_le_bytes());
    }

    /// Copy of this entry carrying a different command identifier.
    pub fn with_cid(mut self, cid: u16) -> Self {
        self.set_cid(cid);
        self
    }

    pub fn nsid(&self) -> u32 {
        self.dword(1).unwrap_or_default()
    }

    pub fn set_nsid(&mut self, nsid: u32) {
        self.set_dword(1, nsid);
    }

    /// Read command dword `index`, or `None` past dword 15.
    pub fn dword(&self, index: usize) -> Option<u32> {
        let bytes = dword_bytes(index).and_then(|range| self.0.get(range))?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Write command dword `index`. Returns `false` past dword 15.
    pub fn set_dword(&mut self, index: usize, value: u32) -> bool {
        match dword_bytes(index).and_then(|range| self.0.get_mut(range)) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn data_direction(&self) -> DataDirection {
        match self.opcode() & 0x03 {
            0x01 => DataDirection::HostToController,
            0x02 => DataDirection::ControllerToHost,
            0x03 => DataDirection::Bidirectional,
            _ => DataDirection::None,
        }
    }

    /// Length field of the first SGL descriptor.
    pub fn sgl_length(&self) -> u32 {
        u32::from_le_bytes([self.0[32], self.0[33], self.0[34], self.0[35]])
    }

    /// Descriptor type byte of the first SGL descriptor.
    pub fn sgl_type(&self) -> u8 {
        self.0[39]
    }

    /// Describe the data as transport-managed (R2T / Data PDUs).
    pub fn set_transport_sgl(&mut self, len: u32) {
        self.set_sgl(SGL_TRANSPORT_DATA_BLOCK, 0, len);
    }

    /// Describe the data as carried inside the command capsule.
    pub fn set_in_capsule_sgl(&mut self, len: u32) {
        self.set_sgl(SGL_DATA_BLOCK_OFFSET, 0, len);
    }

    fn set_sgl(&mut self, kind: u8, addr: u64, len: u32) {
        self.0[24..32].copy_from_slice(&addr.to_le_bytes());
        self.0[32..36].copy_from_slice(&len.to_le_bytes());
        self.0[36..39].fill(0);
        self.0[39] = kind;
    }

    pub fn has_in_capsule_data(&self) -> bool {
        self.sgl_type() == SGL_DATA_BLOCK_OFFSET
    }
}

/// Byte range of command dword `index` inside an SQE.
fn dword_bytes(index: usize) -> Option<std::ops::Range<usize>> {
    let at = index.checked_mul(4)?;
    Some(at..at.checked_add(4)?)
}

impl std::fmt::Debug for SubmissionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionEntry")
            .field("opcode", &format_args!("{:#04x}", self.opcode()))
            .field("cid", &self.cid())
            .field("nsid", &self.nsid())
            .field("sgl_type", &format_args!("{:#04x}", self.sgl_type()))
            .field("sgl_len", &self.sgl_length())
            .finish()
    }
}

/// One 16-byte completion queue entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionEntry([u8; CQE_SIZE]);

impl CompletionEntry {
    pub fn new(cid: u16, status: u16) -> Self {
        let mut cqe = Self::default();
        cqe.set_cid(cid);
        cqe.set_status(status);
        cqe
    }

    pub fn success(cid: u16) -> Self {
        Self::new(cid, status::SUCCESS)
    }

    pub fn from_bytes(raw: [u8; CQE_SIZE]) -> Self {
        Self(raw)
    }

    /// Copy from a slice of at least [`CQE_SIZE`] bytes.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; CQE_SIZE] = raw.get(..CQE_SIZE)?.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; CQE_SIZE] {
        &self.0
    }

    /// Command-specific dword 0.
    pub fn cdw0(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn set_cdw0(&mut self, value: u32) {
        self.0[0..4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn sq_head(&self) -> u16 {
        u16::from_le_bytes([self.0[8], self.0[9]])
    }

    pub fn set_sq_head(&mut self, head: u16) {
        self.0[8..10].copy_from_slice(&head.to_le_bytes());
    }

    pub fn sq_id(&self) -> u16 {
        u16::from_le_bytes([self.0[10], self.0[11]])
    }

    pub fn set_sq_id(&mut self, id: u16) {
        self.0[10..12].copy_from_slice(&id.to_le_bytes());
    }

    pub fn cid(&self) -> u16 {
        u16::from_le_bytes([self.0[12], self.0[13]])
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.0[12..14].copy_from_slice(&cid.to_le_bytes());
    }

    /// Status field without the phase bit.
    pub fn status(&self) -> u16 {
        u16::from_le_bytes([self.0[14], self.0[15]]) >> 1
    }

    /// Set the status field, preserving the phase bit.
    pub fn set_status(&mut self, status: u16) {
        let phase = self.0[14] & 0x01;
        let raw = (status << 1) | phase as u16;
        self.0[14..16].copy_from_slice(&raw.to_le_bytes());
    }

    pub fn is_success(&self) -> bool {
        self.status() == status::SUCCESS
    }
}

impl std::fmt::Debug for CompletionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionEntry")
            .field("cid", &self.cid())
            .field("status", &format_args!("{:#06x}", self.status()))
            .field("sq_head", &self.sq_head())
            .field("cdw0", &self.cdw0())
            .finish()
    }
}
