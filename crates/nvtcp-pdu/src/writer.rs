use std::io::{ErrorKind, Write};
use std::time::Duration;

use bytes::BytesMut;
use nvtcp_wire::WireStream;

use crate::codec::{encode_pdu, Pdu, PduConfig};
use crate::error::{PduError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Destination for outbound PDUs.
pub trait PduSink: Send {
    /// Encode and transmit one PDU (blocking).
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()>;
}

/// Writes complete PDUs to any `Write` stream.
pub struct PduWriter<T> {
    inner: T,
    buf: BytesMut,
    config: PduConfig,
}

impl<T: Write> PduWriter<T> {
    pub fn new(inner: T, config: PduConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write a complete PDU (blocking).
    pub fn write_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.buf.clear();
        encode_pdu(pdu, &self.config, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(PduError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(PduError::Io(err)),
            }
        }

        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(PduError::Io(err)),
            }
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

    pub fn config(&self) -> &PduConfig {
        &self.config
    }
}

impl PduWriter<WireStream> {
    /// Create a PDU writer for `WireStream` and apply a write timeout.
    pub fn with_config_wire(
        inner: WireStream,
        config: PduConfig,
        write_timeout: Option<Duration>,
    ) -> Result<Self> {
        inner
            .set_write_timeout(write_timeout)
            .map_err(|err| PduError::Io(std::io::Error::other(err.to_string())))?;
        Ok(Self::new(inner, config))
    }
}

impl<T: Write + Send> PduSink for PduWriter<T> {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_pdu(pdu)
    }
}
