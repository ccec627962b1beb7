//! `tokio_util` codec for framing PDUs on async streams.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_pdu, encode_pdu, InboundPdu, Pdu, PduConfig};
use crate::error::PduError;

/// Frames inbound PDUs and encodes outbound ones with fixed connection settings.
#[derive(Debug, Clone, Default)]
pub struct PduCodec {
    config: PduConfig,
}

impl PduCodec {
    pub fn new(config: PduConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PduConfig {
        &self.config
    }
}

impl Decoder for PduCodec {
    type Item = InboundPdu;
    type Error = PduError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_pdu(src, self.config.max_pdu_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(pdu) => Ok(Some(pdu)),
            None if src.is_empty() => Ok(None),
            None => Err(PduError::ConnectionClosed),
        }
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = PduError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_pdu(&item, &self.config, dst)
    }
}

impl Encoder<&Pdu> for PduCodec {
    type Error = PduError;

    fn encode(&mut self, item: &Pdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_pdu(item, &self.config, dst)
    }
}
