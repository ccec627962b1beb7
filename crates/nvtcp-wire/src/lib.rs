//! Byte-stream and direct-placement collaborator interfaces for NVMe/TCP.
//!
//! This is the lowest layer of nvtcp. It provides:
//! - [`WireStream`], a connected TCP (or Unix, for loopback testing) stream
//! - [`PlacementService`], the narrow interface to a hardware direct-placement
//!   engine, plus [`SoftwarePlacement`] for hosts without one
//!
//! Everything else builds on top of these two.

pub mod error;
pub mod placement;
pub mod stream;

pub use error::{Result, WireError};
pub use placement::{
    MemoryDescription, NoPlacement, PlacementEvent, PlacementHandle, PlacementService, Segment,
    SoftwarePlacement, DEFAULT_PAGE_SIZE,
};
pub use stream::{WireControl, WireStream};
