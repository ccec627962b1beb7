//! NVMe/TCP queue pair.
//!
//! A [`QueuePair`] runs one connection with two threads:
//! - a receive loop that validates PDUs and routes data and responses to
//!   tracked command buffers
//! - a transmit loop that turns submitted capsules into PDUs
//!
//! Data-bearing commands get a transfer tag. Accelerated tags map the
//! destination into the placement engine so the NIC can write payloads
//! directly; plain tags move every byte through software. The tag replaces
//! the command identifier on the wire and the application's identifier is
//! restored on completion.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{mpsc, Arc};
//!
//! use nvtcp_pdu::nvme::opcode;
//! use nvtcp_pdu::SubmissionEntry;
//! use nvtcp_qpair::{Capsule, QpairEvent, QueuePair, QueuePairConfig};
//! use nvtcp_wire::{NoPlacement, WireStream};
//!
//! let stream = WireStream::connect("127.0.0.1:4420")?;
//! let (events, completions) = mpsc::channel::<QpairEvent>();
//! let qpair = QueuePair::spawn(
//!     QueuePairConfig::host("io-1"),
//!     stream,
//!     Arc::new(NoPlacement),
//!     Arc::new(events),
//! )?;
//!
//! let write = Capsule::command(SubmissionEntry::new(opcode::WRITE, 1)).with_data(vec![0u8; 4096]);
//! qpair.submit_capsule(write)?;
//! if let Ok(QpairEvent::Capsule(done)) = completions.recv() {
//!     assert!(done.is_success());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod capsule;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod qpair;
pub mod registry;
pub mod tag;
mod transmit;

pub use buffer::{CommandBuffer, DataBuffer, DataFault, Storage};
pub use capsule::{Capsule, Entry, Payload};
pub use config::{QueuePairConfig, Role};
pub use dispatch::DispatchState;
pub use error::{QpairError, Result, TransferError};
pub use qpair::{CapsuleHandler, QpairEvent, QueuePair};
pub use registry::{Registries, Registry, Side};
pub use tag::{Eligibility, Tag, TagAllocator};
