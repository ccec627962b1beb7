use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::BytesMut;
use nvtcp_wire::{WireError, WireStream};

use crate::codec::{decode_pdu, InboundPdu, DEFAULT_MAX_PDU_SIZE};
use crate::error::{PduError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Source of reassembled inbound PDUs.
///
/// Implemented by [`PduReader`] over a socket, and by NIC receive paths that
/// deliver PDUs together with an out-of-band [`crate::RxStatus`].
pub trait PduSource: Send {
    /// Next complete PDU (blocking).
    ///
    /// Returns `Err(PduError::ConnectionClosed)` when the peer closed the stream.
    fn next_pdu(&mut self) -> Result<InboundPdu>;

    /// Bound how long `next_pdu` may block. `None` blocks indefinitely.
    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()>;
}

/// Reads complete PDUs from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete PDUs.
pub struct PduReader<T> {
    inner: T,
    buf: BytesMut,
    max_pdu_size: usize,
}

impl<T: Read> PduReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_max_pdu_size(inner, DEFAULT_MAX_PDU_SIZE)
    }

    pub fn with_max_pdu_size(inner: T, max_pdu_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_pdu_size,
        }
    }

    /// Read the next complete PDU (blocking).
    ///
    /// Returns `Err(PduError::ConnectionClosed)` when EOF is reached.
    pub fn read_pdu(&mut self) -> Result<InboundPdu> {
        loop {
            if let Some(pdu) = decode_pdu(&mut self.buf, self.max_pdu_size)? {
                return Ok(pdu);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(PduError::Io(err)),
            };

            if read == 0 {
                return Err(PduError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn max_pdu_size(&self) -> usize {
        self.max_pdu_size
    }
}

impl PduReader<WireStream> {
    /// Create a PDU reader for `WireStream` and apply an initial read timeout.
    pub fn with_config_wire(
        inner: WireStream,
        max_pdu_size: usize,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        inner
            .set_read_timeout(read_timeout)
            .map_err(wire_to_pdu_error)?;
        Ok(Self::with_max_pdu_size(inner, max_pdu_size))
    }
}

impl PduSource for PduReader<WireStream> {
    fn next_pdu(&mut self) -> Result<InboundPdu> {
        self.read_pdu()
    }

    fn set_deadline(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(wire_to_pdu_error)
    }
}

fn wire_to_pdu_error(err: WireError) -> PduError {
    match err {
        WireError::Io(io) => PduError::Io(io),
        WireError::Connect { source, .. } => PduError::Io(source),
        other => PduError::Io(std::io::Error::other(other.to_string())),
    }
}
