use nvtcp_pdu::{FatalErrorStatus, PduError};
use nvtcp_wire::WireError;

/// Errors that can occur in queue pair operations.
#[derive(Debug, thiserror::Error)]
pub enum QpairError {
    /// Wire-level error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// PDU-level error.
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),

    /// Configuration rejected by `QueuePairConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Capsule does not fit the operation (missing or mismatched payload).
    #[error("invalid capsule: {0}")]
    InvalidCapsule(String),

    /// Operation is only available to the other role.
    #[error("{operation} is not available on a {role} queue pair")]
    WrongRole {
        operation: &'static str,
        role: crate::config::Role,
    },

    /// No transfer tag free; retry once outstanding commands complete.
    #[error("transfer tags exhausted")]
    TagsExhausted,

    /// The queue pair is draining and refuses new commands.
    #[error("queue pair is draining")]
    Draining,

    /// The queue pair is shut down.
    #[error("queue pair is closed")]
    Closed,

    /// Offset, length, tag or last-flag rule broken by the peer.
    #[error("sequence violation ({fes:?} at byte {fei}): {detail}")]
    Sequence {
        fes: FatalErrorStatus,
        fei: u32,
        detail: String,
    },

    /// The peer sent a termination request.
    #[error("peer terminated connection ({fes:?}, fei {fei})")]
    PeerTerminated { fes: FatalErrorStatus, fei: u32 },

    /// We sent a termination request and closed.
    #[error("connection terminated locally ({fes:?}, fei {fei})")]
    Terminated { fes: FatalErrorStatus, fei: u32 },

    /// The NIC lost connection state.
    #[error("hardware reset (status {code:#04x})")]
    HardwareReset { code: u8 },

    /// The NIC reported a status code outside the known set.
    #[error("unknown hardware status {code:#04x}")]
    UnknownHardwareStatus { code: u8 },

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl QpairError {
    /// Retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TagsExhausted)
    }

    /// The connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Pdu(err) => err.is_connection_loss(),
            Self::Wire(_)
            | Self::Sequence { .. }
            | Self::PeerTerminated { .. }
            | Self::Terminated { .. }
            | Self::HardwareReset { .. }
            | Self::UnknownHardwareStatus { .. }
            | Self::ConnectionClosed
            | Self::Closed => true,
            _ => false,
        }
    }

    pub(crate) fn sequence(fes: FatalErrorStatus, fei: u32, detail: impl Into<String>) -> Self {
        Self::Sequence {
            fes,
            fei,
            detail: detail.into(),
        }
    }
}

/// Outcome of one data transfer, attached to its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// A data PDU failed its digest; the data may be corrupt.
    #[error("data digest mismatch")]
    DataDigest,

    /// The connection went away before the transfer finished.
    #[error("connection aborted")]
    ConnectionAborted,

    /// No transfer tag was free when the command was transmitted.
    #[error("transfer tags exhausted")]
    TagsExhausted,

    /// The payload is longer than an SGL length can describe.
    #[error("transfer length exceeds 4 GiB")]
    TooLong,
}

impl TransferError {
    /// NVMe status reported in the completion for this outcome.
    pub fn nvme_status(self) -> u16 {
        use nvtcp_pdu::nvme::status;
        match self {
            Self::DataDigest => status::DATA_TRANSFER_ERROR,
            Self::ConnectionAborted => status::ABORTED_SQ_DELETION,
            Self::TagsExhausted => status::TRANSIENT_TRANSPORT_ERROR,
            Self::TooLong => status::DATA_SGL_LENGTH_INVALID,
        }
    }
}

pub type Result<T> = std::result::Result<T, QpairError>;
