//! NVMe/TCP transport engine with direct-placement offload.
//!
//! nvtcp carries NVMe command capsules over a TCP connection: it frames and
//! validates PDUs, assigns transfer tags, tracks in-flight data and, where a
//! placement engine is available, lets the NIC write payloads straight into
//! application buffers.
//!
//! # Crate Structure
//!
//! - [`wire`]: Byte stream and placement-engine interfaces
//! - [`pdu`]: PDU encoding, framing and validation
//! - [`qpair`]: Queue pair: tags, command buffers, receive and transmit loops

/// Re-export wire types.
pub mod wire {
    pub use nvtcp_wire::*;
}

/// Re-export PDU types.
pub mod pdu {
    pub use nvtcp_pdu::*;
}

/// Re-export queue pair types.
pub mod qpair {
    pub use nvtcp_qpair::*;
}

pub use nvtcp_qpair::{
    Capsule, CapsuleHandler, DataBuffer, Payload, QpairError, QpairEvent, QueuePair,
    QueuePairConfig, Role, TransferError,
};
