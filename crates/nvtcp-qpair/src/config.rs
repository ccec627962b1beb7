use std::fmt;
use std::time::Duration;

use nvtcp_pdu::{PduConfig, PduType, DEFAULT_MAX_PDU_SIZE, DIGEST_SIZE};
use nvtcp_wire::DEFAULT_PAGE_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::{QpairError, Result};
use crate::tag::{MAX_ACCELERATED_TAGS, MAX_PLAIN_TAGS};

/// Which end of the connection this queue pair is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Controller,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Controller => f.write_str("controller"),
        }
    }
}

/// Connection parameters for one queue pair, fixed once it is spawned.
///
/// Values normally come from connection setup; missing JSON fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePairConfig {
    pub role: Role,
    /// Name used in log output.
    pub name: String,
    pub header_digest: bool,
    pub data_digest: bool,
    /// PDU data alignment, in dwords minus one.
    pub pda: u8,
    /// Largest H2CData payload the controller accepts.
    pub max_h2c_data: u32,
    /// Largest C2HData payload this end emits as a controller.
    pub max_c2h_data: u32,
    pub max_pdu_size: usize,
    /// Host writes up to this many bytes travel inside the command capsule.
    /// The controller rejects in-capsule data above it.
    pub immediate_data_threshold: u32,
    /// R2Ts a controller keeps in flight; further grants wait their turn.
    pub max_outstanding_r2t: u16,
    pub plain_tags: u16,
    pub accelerated_tags: u16,
    /// Smallest transfer worth a placement mapping.
    pub ddp_threshold: u32,
    pub max_placement_pages: usize,
    pub page_size: usize,
    /// How long to wait for the peer to close after sending a termination request.
    pub termination_grace_ms: u64,
    /// Controller completes reads with a SUCCESS-flagged C2HData instead of
    /// a response capsule.
    pub c2h_success: bool,
}

impl Default for QueuePairConfig {
    fn default() -> Self {
        Self {
            role: Role::Host,
            name: "qpair".to_string(),
            header_digest: false,
            data_digest: false,
            pda: 0,
            max_h2c_data: 128 * 1024,
            max_c2h_data: 128 * 1024,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            immediate_data_threshold: 8 * 1024,
            max_outstanding_r2t: 4,
            plain_tags: 128,
            accelerated_tags: 8,
            ddp_threshold: 4096,
            max_placement_pages: 256,
            page_size: DEFAULT_PAGE_SIZE,
            termination_grace_ms: 1000,
            c2h_success: false,
        }
    }
}

impl QueuePairConfig {
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            role: Role::Host,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn controller(name: impl Into<String>) -> Self {
        Self {
            role: Role::Controller,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pda > 31 {
            return Err(invalid(format!("pda {} exceeds 31", self.pda)));
        }
        if self.max_h2c_data == 0 || self.max_c2h_data == 0 {
            return Err(invalid("data PDU sizes must be non-zero"));
        }
        if self.plain_tags == 0 || self.plain_tags as usize > MAX_PLAIN_TAGS {
            return Err(invalid(format!(
                "plain_tags {} outside 1..={MAX_PLAIN_TAGS}",
                self.plain_tags
            )));
        }
        if self.accelerated_tags as usize > MAX_ACCELERATED_TAGS {
            return Err(invalid(format!(
                "accelerated_tags {} exceeds {MAX_ACCELERATED_TAGS}",
                self.accelerated_tags
            )));
        }
        if self.max_outstanding_r2t == 0 {
            return Err(invalid("max_outstanding_r2t must be at least 1"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(invalid(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }

        let pdu = self.pdu_config();
        let largest_data = self.max_h2c_data.max(self.max_c2h_data) as usize;
        let data_pdu = pdu.data_offset(PduType::C2HData) + largest_data + DIGEST_SIZE;
        let capsule =
            pdu.data_offset(PduType::CapsuleCmd) + self.immediate_data_threshold as usize + DIGEST_SIZE;
        let needed = data_pdu.max(capsule);
        if self.max_pdu_size < needed {
            return Err(invalid(format!(
                "max_pdu_size {} cannot carry a {needed}-byte PDU",
                self.max_pdu_size
            )));
        }
        Ok(())
    }

    /// Codec settings derived from this configuration.
    pub fn pdu_config(&self) -> PduConfig {
        PduConfig {
            header_digest: self.header_digest,
            data_digest: self.data_digest,
            pda: self.pda,
            max_pdu_size: self.max_pdu_size,
        }
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

fn invalid(msg: impl Into<String>) -> QpairError {
    QpairError::InvalidConfig(msg.into())
}
