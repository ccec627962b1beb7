//! NVMe/TCP PDU encoding, framing and validation.
//!
//! Every PDU starts with an 8-byte common header:
//! - PDU type and flags (1 byte each)
//! - header length and data offset (1 byte each)
//! - total PDU length (4 bytes, little-endian)
//!
//! followed by the type-specific header, an optional header digest, padding
//! up to the negotiated data alignment, the payload and an optional data
//! digest. Framing ([`PduReader`], [`decode_pdu`]) only splits the stream
//! into PDUs; [`validate`] checks one PDU against the connection settings.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod error;
pub mod nvme;
pub mod reader;
pub mod status;
pub mod types;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::PduCodec;
pub use codec::{
    decode_pdu, encode_pdu, validate, DataPdu, InboundPdu, Pdu, PduConfig, R2t, TermReq,
    ValidatedPdu, DEFAULT_MAX_PDU_SIZE, MAX_TERM_DATA,
};
pub use error::{PduError, Result};
pub use nvme::{CompletionEntry, DataDirection, SubmissionEntry};
pub use reader::{PduReader, PduSource};
pub use status::{HwClass, RxStatus};
pub use types::{
    align_up, FatalErrorStatus, PduType, COMMON_HEADER_SIZE, DIGEST_SIZE, FLAG_DDGST, FLAG_HDGST,
    FLAG_LAST_PDU, FLAG_SUCCESS,
};
pub use writer::{PduSink, PduWriter};
