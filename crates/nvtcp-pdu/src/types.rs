//! PDU type codes, flag bits and termination reasons.

/// Common header: type (1) + flags (1) + hlen (1) + pdo (1) + plen (4) = 8 bytes.
pub const COMMON_HEADER_SIZE: usize = 8;

/// Header and data digests are CRC32C, 4 bytes each.
pub const DIGEST_SIZE: usize = 4;

/// Header digest present.
pub const FLAG_HDGST: u8 = 0x01;

/// Data digest present.
pub const FLAG_DDGST: u8 = 0x02;

/// Last data PDU of a transfer (or of an R2T grant).
pub const FLAG_LAST_PDU: u8 = 0x04;

/// C2HData only: the command completed successfully, no response capsule follows.
pub const FLAG_SUCCESS: u8 = 0x08;

/// PDU types handled once a connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    H2CTermReq = 0x02,
    C2HTermReq = 0x03,
    CapsuleCmd = 0x04,
    CapsuleResp = 0x05,
    H2CData = 0x06,
    C2HData = 0x07,
    R2T = 0x09,
}

impl PduType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::H2CTermReq),
            0x03 => Some(Self::C2HTermReq),
            0x04 => Some(Self::CapsuleCmd),
            0x05 => Some(Self::CapsuleResp),
            0x06 => Some(Self::H2CData),
            0x07 => Some(Self::C2HData),
            0x09 => Some(Self::R2T),
            _ => None,
        }
    }

    /// Fixed header length (common + type-specific) for this type.
    pub fn header_len(self) -> usize {
        match self {
            Self::CapsuleCmd => COMMON_HEADER_SIZE + crate::nvme::SQE_SIZE,
            Self::CapsuleResp => COMMON_HEADER_SIZE + crate::nvme::CQE_SIZE,
            Self::H2CTermReq
            | Self::C2HTermReq
            | Self::H2CData
            | Self::C2HData
            | Self::R2T => 24,
        }
    }

    /// Termination requests never carry digests.
    pub fn supports_digest(self) -> bool {
        !self.is_termination()
    }

    pub fn is_termination(self) -> bool {
        matches!(self, Self::H2CTermReq | Self::C2HTermReq)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::H2CData | Self::C2HData)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::H2CTermReq => "H2CTermReq",
            Self::C2HTermReq => "C2HTermReq",
            Self::CapsuleCmd => "CapsuleCmd",
            Self::CapsuleResp => "CapsuleResp",
            Self::H2CData => "H2CData",
            Self::C2HData => "C2HData",
            Self::R2T => "R2T",
        }
    }
}

impl std::fmt::Display for PduType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fatal error status carried in a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FatalErrorStatus {
    InvalidHeaderField = 0x01,
    PduSequenceError = 0x02,
    HeaderDigestError = 0x03,
    DataTransferOutOfRange = 0x04,
    DataTransferLimitExceeded = 0x05,
    UnsupportedParameter = 0x06,
}

impl FatalErrorStatus {
    pub fn from_raw(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Self::InvalidHeaderField),
            0x02 => Some(Self::PduSequenceError),
            0x03 => Some(Self::HeaderDigestError),
            0x04 => Some(Self::DataTransferOutOfRange),
            0x05 => Some(Self::DataTransferLimitExceeded),
            0x06 => Some(Self::UnsupportedParameter),
            _ => None,
        }
    }

    /// Whether the field-error-information word carries a byte offset.
    pub fn has_field_offset(self) -> bool {
        matches!(self, Self::InvalidHeaderField | Self::UnsupportedParameter)
    }
}

/// Byte offsets of header fields, reported as field error information.
pub mod field {
    pub const PDU_TYPE: u32 = 0;
    pub const FLAGS: u32 = 1;
    pub const HLEN: u32 = 2;
    pub const PDO: u32 = 3;
    pub const PLEN: u32 = 4;
    pub const CCCID: u32 = 8;
    pub const TTAG: u32 = 10;
    pub const DATAO: u32 = 12;
    pub const DATAL: u32 = 16;
}

/// Round `value` up to a multiple of `align` (a power of two or any non-zero value).
pub fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
