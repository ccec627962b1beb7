use crate::status::HwClass;
use crate::types::{field, FatalErrorStatus, PduType};

/// Errors that can occur during PDU encoding, framing or validation.
#[derive(Debug, thiserror::Error)]
pub enum PduError {
    /// The PDU type byte is not one this transport handles.
    #[error("unknown PDU type {raw:#04x}")]
    UnknownType { raw: u8 },

    /// Header length does not match the type's fixed header size.
    #[error("{pdu_type} header length {actual} (expected {expected})")]
    HeaderLength {
        pdu_type: PduType,
        expected: usize,
        actual: usize,
    },

    /// A header field holds a value inconsistent with the PDU or connection.
    #[error("invalid {name} field at byte {offset}")]
    InvalidField { name: &'static str, offset: u32 },

    /// The PDU is shorter than its header claims.
    #[error("truncated PDU ({available} bytes, need {needed})")]
    Truncated { needed: usize, available: usize },

    /// Header digest did not match the header bytes.
    #[error("header digest mismatch (received {received:#010x}, computed {computed:#010x})")]
    HeaderDigest { received: u32, computed: u32 },

    /// The PDU exceeds the configured maximum size.
    #[error("PDU too large ({size} bytes, max {max})")]
    PduTooLarge { size: usize, max: usize },

    /// The NIC reported a fault for this PDU.
    #[error("hardware status {code:#04x} ({class:?})")]
    Hardware { code: u8, class: HwClass },

    /// An I/O error occurred while reading or writing PDUs.
    #[error("PDU I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete PDU was received.
    #[error("connection closed (incomplete PDU)")]
    ConnectionClosed,
}

impl PduError {
    /// Termination reason and field error information to report to the peer,
    /// or `None` when no termination request should be sent.
    pub fn termination(&self) -> Option<(FatalErrorStatus, u32)> {
        use FatalErrorStatus::*;
        match self {
            Self::UnknownType { .. } => Some((InvalidHeaderField, field::PDU_TYPE)),
            Self::HeaderLength { .. } => Some((InvalidHeaderField, field::HLEN)),
            Self::InvalidField { offset, .. } => Some((InvalidHeaderField, *offset)),
            Self::Truncated { .. } => Some((InvalidHeaderField, field::PLEN)),
            Self::HeaderDigest { .. } => Some((HeaderDigestError, 0)),
            Self::PduTooLarge { .. } => Some((DataTransferLimitExceeded, 0)),
            Self::Hardware { class, .. } => match class {
                HwClass::Malformed { fes, fei } => Some((*fes, *fei)),
                HwClass::Sequence => Some((PduSequenceError, 0)),
                _ => None,
            },
            Self::Io(_) | Self::ConnectionClosed => None,
        }
    }

    /// Ordering or tag faults; never recoverable.
    pub fn is_sequence_violation(&self) -> bool {
        matches!(
            self,
            Self::Hardware {
                class: HwClass::Sequence,
                ..
            }
        )
    }

    /// The stream itself is gone or the NIC lost state; nothing can be sent.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::Hardware {
                    class: HwClass::Reset,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, PduError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_faults_map_to_invalid_field() {
        let err = PduError::InvalidField {
            name: "pdo",
            offset: field::PDO,
        };
        assert_eq!(
            err.termination(),
            Some((FatalErrorStatus::InvalidHeaderField, field::PDO))
        );
    }

    #[test]
    fn hardware_classes_map_individually() {
        let seq = PduError::Hardware {
            code: 0x07,
            class: HwClass::Sequence,
        };
        assert!(seq.is_sequence_violation());
        assert_eq!(
            seq.termination(),
            Some((FatalErrorStatus::PduSequenceError, 0))
        );

        let reset = PduError::Hardware {
            code: 0x0b,
            class: HwClass::Reset,
        };
        assert!(reset.is_connection_loss());
        assert_eq!(reset.termination(), None);

        let unknown = PduError::Hardware {
            code: 0x7f,
            class: HwClass::Unknown,
        };
        assert!(!unknown.is_connection_loss());
        assert_eq!(unknown.termination(), None);
    }
}
