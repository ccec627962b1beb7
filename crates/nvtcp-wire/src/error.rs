/// Errors that can occur on the wire or in the placement engine.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the stream.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The placement engine has no room for another mapping.
    #[error("placement table full ({capacity} mappings)")]
    PlacementFull { capacity: usize },

    /// The placement engine rejected a memory description.
    #[error("placement rejected: {0}")]
    PlacementRejected(String),

    /// A register write targeted an address outside the device window.
    #[error("register write out of range at {addr:#x} ({len} bytes)")]
    RegisterRange { addr: u32, len: usize },

    /// The stream has been shut down.
    #[error("wire shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, WireError>;
