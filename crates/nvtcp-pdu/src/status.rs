//! Out-of-band receive status reported by the NIC alongside each PDU.
//!
//! An offloading NIC validates framing and digests in hardware and may place
//! data PDU payload directly into host memory. It reports what it did through
//! a status word delivered next to the reassembled PDU bytes, so the engine
//! never has to re-inspect raw bytes to learn about hardware-detected faults.

use crate::types::{field, FatalErrorStatus};

/// Vendor status codes. The set is closed; anything else is unknown.
pub mod code {
    pub const OK: u8 = 0x00;
    pub const HEADER_DIGEST: u8 = 0x01;
    pub const DATA_DIGEST: u8 = 0x02;
    pub const PDU_LENGTH: u8 = 0x03;
    pub const HEADER_LENGTH: u8 = 0x04;
    pub const PDU_TYPE: u8 = 0x05;
    pub const BAD_TAG: u8 = 0x06;
    pub const BAD_OFFSET: u8 = 0x07;
    pub const PLACEMENT_FAULT: u8 = 0x08;
    pub const PDO: u8 = 0x09;
    pub const FLAGS: u8 = 0x0a;
    pub const LINK_RESET: u8 = 0x0b;
}

/// How the engine must treat a hardware status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwClass {
    Ok,
    /// Header-level fault; answered with a termination request.
    Malformed { fes: FatalErrorStatus, fei: u32 },
    /// Ordering or tag fault; always tears the connection down.
    Sequence,
    /// Payload digest mismatch; the transfer completes with a data error.
    DataDigest,
    /// The NIC lost connection state; reset without a termination request.
    Reset,
    /// Not a code this engine knows.
    Unknown,
}

/// Receive status for one reassembled PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxStatus {
    /// Vendor status code.
    pub code: u8,
    /// Payload was placed directly into the tagged buffer and is not
    /// included in the delivered bytes.
    pub placed: bool,
}

impl RxStatus {
    pub const OK: Self = Self {
        code: code::OK,
        placed: false,
    };

    /// Payload placed by hardware, no faults.
    pub const PLACED: Self = Self {
        code: code::OK,
        placed: true,
    };

    pub fn with_code(code: u8) -> Self {
        Self {
            code,
            placed: false,
        }
    }

    pub fn classify(&self) -> HwClass {
        use FatalErrorStatus::*;
        match self.code {
            code::OK => HwClass::Ok,
            code::HEADER_DIGEST => HwClass::Malformed {
                fes: HeaderDigestError,
                fei: 0,
            },
            code::DATA_DIGEST => HwClass::DataDigest,
            code::PDU_LENGTH => HwClass::Malformed {
                fes: InvalidHeaderField,
                fei: field::PLEN,
            },
            code::HEADER_LENGTH => HwClass::Malformed {
                fes: InvalidHeaderField,
                fei: field::HLEN,
            },
            code::PDU_TYPE => HwClass::Malformed {
                fes: InvalidHeaderField,
                fei: field::PDU_TYPE,
            },
            code::PDO => HwClass::Malformed {
                fes: InvalidHeaderField,
                fei: field::PDO,
            },
            code::FLAGS => HwClass::Malformed {
                fes: InvalidHeaderField,
                fei: field::FLAGS,
            },
            code::BAD_TAG | code::BAD_OFFSET => HwClass::Sequence,
            code::PLACEMENT_FAULT | code::LINK_RESET => HwClass::Reset,
            _ => HwClass::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_classify() {
        assert_eq!(RxStatus::OK.classify(), HwClass::Ok);
        assert_eq!(RxStatus::PLACED.classify(), HwClass::Ok);
        assert_eq!(
            RxStatus::with_code(code::DATA_DIGEST).classify(),
            HwClass::DataDigest
        );
        assert_eq!(
            RxStatus::with_code(code::BAD_OFFSET).classify(),
            HwClass::Sequence
        );
        assert_eq!(
            RxStatus::with_code(code::LINK_RESET).classify(),
            HwClass::Reset
        );
        assert!(matches!(
            RxStatus::with_code(code::HEADER_DIGEST).classify(),
            HwClass::Malformed {
                fes: FatalErrorStatus::HeaderDigestError,
                ..
            }
        ));
    }

    #[test]
    fn unrecognized_code_is_unknown() {
        assert_eq!(RxStatus::with_code(0x7f).classify(), HwClass::Unknown);
    }
}
