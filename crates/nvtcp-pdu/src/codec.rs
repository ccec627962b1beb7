use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PduError, Result};
use crate::nvme::{CompletionEntry, SubmissionEntry, CQE_SIZE, SQE_SIZE};
use crate::status::{HwClass, RxStatus};
use crate::types::{
    align_up, field, FatalErrorStatus, PduType, COMMON_HEADER_SIZE, DIGEST_SIZE, FLAG_DDGST,
    FLAG_HDGST, FLAG_LAST_PDU, FLAG_SUCCESS,
};

/// Default maximum PDU size: 1 MiB plus room for headers and digests.
pub const DEFAULT_MAX_PDU_SIZE: usize = 1024 * 1024 + 256;

/// Bytes of the offending header echoed back in a termination request.
pub const MAX_TERM_DATA: usize = 128;

/// Per-connection codec settings, fixed at connection setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduConfig {
    /// Header digests enabled.
    pub header_digest: bool,
    /// Data digests enabled.
    pub data_digest: bool,
    /// PDU data alignment in dwords minus one; payload starts on a
    /// `(pda + 1) * 4` byte boundary.
    pub pda: u8,
    /// Largest PDU accepted or produced.
    pub max_pdu_size: usize,
}

impl Default for PduConfig {
    fn default() -> Self {
        Self {
            header_digest: false,
            data_digest: false,
            pda: 0,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }
}

impl PduConfig {
    /// Payload alignment in bytes.
    pub fn data_alignment(&self) -> usize {
        (self.pda as usize + 1) * 4
    }

    fn header_digest_len(&self, pdu_type: PduType) -> usize {
        if self.header_digest && pdu_type.supports_digest() {
            DIGEST_SIZE
        } else {
            0
        }
    }

    /// PDU data offset for a type carrying payload.
    pub fn data_offset(&self, pdu_type: PduType) -> usize {
        if pdu_type.is_termination() {
            return pdu_type.header_len();
        }
        align_up(
            pdu_type.header_len() + self.header_digest_len(pdu_type),
            self.data_alignment(),
        )
    }
}

/// H2CData / C2HData fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPdu {
    /// Identifier of the command this data belongs to (as sent on the wire).
    pub cccid: u16,
    /// Transfer tag from the R2T (H2CData only).
    pub ttag: u16,
    /// Offset of this chunk within the command's data.
    pub offset: u32,
    /// Declared length of this chunk.
    pub length: u32,
    pub last: bool,
    /// C2HData only: command completed successfully, no response follows.
    pub success: bool,
    /// Payload; empty when the NIC placed it directly.
    pub data: Bytes,
}

/// Ready-to-transfer grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct R2t {
    pub cccid: u16,
    pub ttag: u16,
    pub offset: u32,
    pub length: u32,
}

/// Termination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermReq {
    pub fes: FatalErrorStatus,
    pub fei: u32,
    /// Leading bytes of the PDU that caused the termination.
    pub header: Bytes,
}

impl TermReq {
    pub fn new(fes: FatalErrorStatus, fei: u32, offending: &[u8]) -> Self {
        let keep = offending.len().min(MAX_TERM_DATA);
        Self {
            fes,
            fei,
            header: Bytes::copy_from_slice(&offending[..keep]),
        }
    }
}

/// A typed PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    CapsuleCmd {
        sqe: SubmissionEntry,
        /// In-capsule data.
        data: Bytes,
    },
    CapsuleResp {
        cqe: CompletionEntry,
    },
    H2CData(DataPdu),
    C2HData(DataPdu),
    R2T(R2t),
    H2CTermReq(TermReq),
    C2HTermReq(TermReq),
}

impl Pdu {
    pub fn pdu_type(&self) -> PduType {
        match self {
            Self::CapsuleCmd { .. } => PduType::CapsuleCmd,
            Self::CapsuleResp { .. } => PduType::CapsuleResp,
            Self::H2CData(_) => PduType::H2CData,
            Self::C2HData(_) => PduType::C2HData,
            Self::R2T(_) => PduType::R2T,
            Self::H2CTermReq(_) => PduType::H2CTermReq,
            Self::C2HTermReq(_) => PduType::C2HTermReq,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::CapsuleCmd { data, .. } => data,
            Self::H2CData(pdu) | Self::C2HData(pdu) => &pdu.data,
            Self::H2CTermReq(term) | Self::C2HTermReq(term) => &term.header,
            Self::CapsuleResp { .. } | Self::R2T(_) => &[],
        }
    }

    fn type_flags(&self) -> u8 {
        match self {
            Self::H2CData(pdu) | Self::C2HData(pdu) => {
                let mut flags = 0;
                if pdu.last {
                    flags |= FLAG_LAST_PDU;
                }
                if pdu.success {
                    flags |= FLAG_SUCCESS;
                }
                flags
            }
            _ => 0,
        }
    }

    fn put_specific_header(&self, dst: &mut BytesMut) {
        match self {
            Self::CapsuleCmd { sqe, .. } => dst.put_slice(sqe.as_bytes()),
            Self::CapsuleResp { cqe } => dst.put_slice(cqe.as_bytes()),
            Self::H2CData(pdu) | Self::C2HData(pdu) => {
                dst.put_u16_le(pdu.cccid);
                dst.put_u16_le(pdu.ttag);
                dst.put_u32_le(pdu.offset);
                dst.put_u32_le(pdu.length);
                dst.put_u32_le(0);
            }
            Self::R2T(r2t) => {
                dst.put_u16_le(r2t.cccid);
                dst.put_u16_le(r2t.ttag);
                dst.put_u32_le(r2t.offset);
                dst.put_u32_le(r2t.length);
                dst.put_u32_le(0);
            }
            Self::H2CTermReq(term) | Self::C2HTermReq(term) => {
                dst.put_u16_le(term.fes as u16);
                dst.put_u32_le(term.fei);
                dst.put_bytes(0, 10);
            }
        }
    }
}

/// Encode a PDU into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────┬──────────────┬───────┬─────────┬──────────┬───────┐
/// │ Common │ Type-specific│ HDGST │ Padding │ Payload  │ DDGST │
/// │ (8B)   │ header       │ (4B)? │ to PDO  │          │ (4B)? │
/// └────────┴──────────────┴───────┴─────────┴──────────┴───────┘
/// ```
pub fn encode_pdu(pdu: &Pdu, config: &PduConfig, dst: &mut BytesMut) -> Result<()> {
    let pdu_type = pdu.pdu_type();
    let hlen = pdu_type.header_len();
    let hdgst = config.header_digest_len(pdu_type);
    let payload = pdu.payload();
    let ddgst = if config.data_digest && pdu_type.supports_digest() && !payload.is_empty() {
        DIGEST_SIZE
    } else {
        0
    };
    let pdo = if payload.is_empty() {
        0
    } else {
        config.data_offset(pdu_type)
    };
    let plen = if payload.is_empty() {
        hlen + hdgst
    } else {
        pdo + payload.len() + ddgst
    };
    if plen > config.max_pdu_size {
        return Err(PduError::PduTooLarge {
            size: plen,
            max: config.max_pdu_size,
        });
    }

    let mut flags = pdu.type_flags();
    if hdgst > 0 {
        flags |= FLAG_HDGST;
    }
    if ddgst > 0 {
        flags |= FLAG_DDGST;
    }

    dst.reserve(plen);
    let start = dst.len();
    dst.put_u8(pdu_type as u8);
    dst.put_u8(flags);
    dst.put_u8(hlen as u8);
    dst.put_u8(if pdu_type.is_termination() { 0 } else { pdo as u8 });
    dst.put_u32_le(plen as u32);
    pdu.put_specific_header(dst);
    debug_assert_eq!(dst.len() - start, hlen);

    if hdgst > 0 {
        let digest = crc32c::crc32c(&dst[start..start + hlen]);
        dst.put_u32_le(digest);
    }
    if !payload.is_empty() {
        let pad = pdo - (dst.len() - start);
        dst.put_bytes(0, pad);
        dst.put_slice(payload);
        if ddgst > 0 {
            dst.put_u32_le(crc32c::crc32c(payload));
        }
    }
    Ok(())
}

/// One reassembled PDU as delivered by the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPdu {
    /// PDU bytes. When `status.placed` is set, only the bytes up to the data
    /// offset are present; the payload already sits in the tagged buffer.
    pub bytes: Bytes,
    pub status: RxStatus,
}

impl InboundPdu {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            status: RxStatus::OK,
        }
    }

    pub fn with_status(bytes: Bytes, status: RxStatus) -> Self {
        Self { bytes, status }
    }

    /// Raw type byte, if at least one byte is present.
    pub fn raw_type(&self) -> Option<u8> {
        self.bytes.first().copied()
    }
}

/// Split one PDU off the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete PDU yet.
/// On success, consumes the PDU bytes from the buffer.
pub fn decode_pdu(src: &mut BytesMut, max_pdu_size: usize) -> Result<Option<InboundPdu>> {
    if src.len() < COMMON_HEADER_SIZE {
        return Ok(None);
    }

    let plen = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if plen < COMMON_HEADER_SIZE {
        return Err(PduError::InvalidField {
            name: "plen",
            offset: field::PLEN,
        });
    }
    if plen > max_pdu_size {
        return Err(PduError::PduTooLarge {
            size: plen,
            max: max_pdu_size,
        });
    }
    if src.len() < plen {
        src.reserve(plen - src.len());
        return Ok(None);
    }

    Ok(Some(InboundPdu::new(src.split_to(plen).freeze())))
}

/// A PDU that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPdu {
    pub pdu: Pdu,
    /// Declared payload length.
    pub data_len: usize,
    /// Payload digest did not match (computed here or reported by the NIC).
    /// The payload is still delivered.
    pub data_digest_error: bool,
    /// Payload was placed directly by the NIC.
    pub placed: bool,
}

/// Validate one inbound PDU against the connection settings.
///
/// Checks run in order: header length against the type, hardware status,
/// header digest, data digest (recorded, not failed), then the type-specific
/// fields.
pub fn validate(inbound: &InboundPdu, config: &PduConfig) -> Result<ValidatedPdu> {
    let bytes = &inbound.bytes;
    if bytes.len() < COMMON_HEADER_SIZE {
        return Err(PduError::Truncated {
            needed: COMMON_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let pdu_type =
        PduType::from_raw(bytes[0]).ok_or(PduError::UnknownType { raw: bytes[0] })?;
    let flags = bytes[1];
    let hlen = bytes[2] as usize;
    let pdo = bytes[3] as usize;
    let plen = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    if hlen != pdu_type.header_len() {
        return Err(PduError::HeaderLength {
            pdu_type,
            expected: pdu_type.header_len(),
            actual: hlen,
        });
    }

    let mut data_digest_error = false;
    match inbound.status.classify() {
        HwClass::Ok => {}
        HwClass::DataDigest => data_digest_error = true,
        class => {
            return Err(PduError::Hardware {
                code: inbound.status.code,
                class,
            })
        }
    }
    if inbound.status.placed && !pdu_type.is_data() {
        return Err(PduError::InvalidField {
            name: "pdu-type",
            offset: field::PDU_TYPE,
        });
    }

    let has_hdgst = flags & FLAG_HDGST != 0;
    let expect_hdgst = config.header_digest && pdu_type.supports_digest();
    if has_hdgst != expect_hdgst {
        return Err(PduError::InvalidField {
            name: "flags",
            offset: field::FLAGS,
        });
    }
    let hdgst = if has_hdgst { DIGEST_SIZE } else { 0 };
    let header_end = hlen + hdgst;
    if plen < header_end {
        return Err(PduError::InvalidField {
            name: "plen",
            offset: field::PLEN,
        });
    }
    if bytes.len() < header_end {
        return Err(PduError::Truncated {
            needed: header_end,
            available: bytes.len(),
        });
    }

    if has_hdgst {
        let received = u32::from_le_bytes([
            bytes[hlen],
            bytes[hlen + 1],
            bytes[hlen + 2],
            bytes[hlen + 3],
        ]);
        let computed = crc32c::crc32c(&bytes[..hlen]);
        if received != computed {
            return Err(PduError::HeaderDigest { received, computed });
        }
    }

    let (data_start, data_len, has_ddgst) = payload_layout(pdu_type, flags, pdo, plen, config)?;

    let data = if inbound.status.placed {
        if bytes.len() < data_start.min(plen) {
            return Err(PduError::Truncated {
                needed: data_start,
                available: bytes.len(),
            });
        }
        Bytes::new()
    } else {
        if bytes.len() != plen {
            return Err(PduError::Truncated {
                needed: plen,
                available: bytes.len(),
            });
        }
        let data = bytes.slice(data_start..data_start + data_len);
        if has_ddgst {
            let at = data_start + data_len;
            let received =
                u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            if received != crc32c::crc32c(&data) {
                data_digest_error = true;
            }
        }
        data
    };

    let pdu = parse_specific(pdu_type, flags, &bytes[COMMON_HEADER_SIZE..hlen], data, data_len)?;
    Ok(ValidatedPdu {
        pdu,
        data_len,
        data_digest_error,
        placed: inbound.status.placed,
    })
}

/// Where the payload sits: (start, length, data digest present).
fn payload_layout(
    pdu_type: PduType,
    flags: u8,
    pdo: usize,
    plen: usize,
    config: &PduConfig,
) -> Result<(usize, usize, bool)> {
    let hlen = pdu_type.header_len();
    let has_ddgst = flags & FLAG_DDGST != 0;

    if pdu_type.is_termination() {
        if has_ddgst {
            return Err(PduError::InvalidField {
                name: "flags",
                offset: field::FLAGS,
            });
        }
        return Ok((hlen, plen - hlen, false));
    }

    let header_end = hlen + config.header_digest_len(pdu_type);
    if plen == header_end {
        if has_ddgst {
            return Err(PduError::InvalidField {
                name: "flags",
                offset: field::FLAGS,
            });
        }
        return Ok((header_end, 0, false));
    }

    if matches!(pdu_type, PduType::CapsuleResp | PduType::R2T) {
        return Err(PduError::InvalidField {
            name: "plen",
            offset: field::PLEN,
        });
    }
    if pdo != config.data_offset(pdu_type) {
        return Err(PduError::InvalidField {
            name: "pdo",
            offset: field::PDO,
        });
    }
    if has_ddgst != config.data_digest {
        return Err(PduError::InvalidField {
            name: "flags",
            offset: field::FLAGS,
        });
    }
    let ddgst = if has_ddgst { DIGEST_SIZE } else { 0 };
    if plen <= pdo + ddgst {
        return Err(PduError::InvalidField {
            name: "plen",
            offset: field::PLEN,
        });
    }
    Ok((pdo, plen - pdo - ddgst, has_ddgst))
}

fn parse_specific(
    pdu_type: PduType,
    flags: u8,
    mut header: &[u8],
    data: Bytes,
    data_len: usize,
) -> Result<Pdu> {
    match pdu_type {
        PduType::CapsuleCmd => {
            let sqe = SubmissionEntry::from_slice(header).ok_or(PduError::Truncated {
                needed: SQE_SIZE,
                available: header.len(),
            })?;
            Ok(Pdu::CapsuleCmd { sqe, data })
        }
        PduType::CapsuleResp => {
            let cqe = CompletionEntry::from_slice(header).ok_or(PduError::Truncated {
                needed: CQE_SIZE,
                available: header.len(),
            })?;
            Ok(Pdu::CapsuleResp { cqe })
        }
        PduType::H2CData | PduType::C2HData => {
            let cccid = header.get_u16_le();
            let ttag = header.get_u16_le();
            let offset = header.get_u32_le();
            let length = header.get_u32_le();
            if length as usize != data_len {
                return Err(PduError::InvalidField {
                    name: "datal",
                    offset: field::DATAL,
                });
            }
            let last = flags & FLAG_LAST_PDU != 0;
            let success = flags & FLAG_SUCCESS != 0;
            if success && (pdu_type == PduType::H2CData || !last) {
                return Err(PduError::InvalidField {
                    name: "flags",
                    offset: field::FLAGS,
                });
            }
            let pdu = DataPdu {
                cccid,
                ttag,
                offset,
                length,
                last,
                success,
                data,
            };
            Ok(if pdu_type == PduType::H2CData {
                Pdu::H2CData(pdu)
            } else {
                Pdu::C2HData(pdu)
            })
        }
        PduType::R2T => {
            let cccid = header.get_u16_le();
            let ttag = header.get_u16_le();
            let offset = header.get_u32_le();
            let length = header.get_u32_le();
            Ok(Pdu::R2T(R2t {
                cccid,
                ttag,
                offset,
                length,
            }))
        }
        PduType::H2CTermReq | PduType::C2HTermReq => {
            let raw_fes = header.get_u16_le();
            let fei = header.get_u32_le();
            let fes = FatalErrorStatus::from_raw(raw_fes).ok_or(PduError::InvalidField {
                name: "fes",
                offset: field::CCCID,
            })?;
            let term = TermReq {
                fes,
                fei,
                header: data,
            };
            Ok(if pdu_type == PduType::H2CTermReq {
                Pdu::H2CTermReq(term)
            } else {
                Pdu::C2HTermReq(term)
            })
        }
    }
}
