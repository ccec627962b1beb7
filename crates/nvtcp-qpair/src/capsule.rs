use bytes::Bytes;
use nvtcp_pdu::{CompletionEntry, SubmissionEntry};

use crate::buffer::{DataBuffer, Storage};
use crate::error::TransferError;

/// Submission or completion entry a capsule carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Command(SubmissionEntry),
    Response(CompletionEntry),
}

/// Data attached to a capsule.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    /// Bytes to send (host writes) or received in-capsule (controller).
    Bytes(Bytes),
    /// Destination for data the peer sends (host reads).
    Buffer(DataBuffer),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Bytes(bytes) => bytes.len(),
            Self::Buffer(buffer) => buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Storage> for Payload {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::None => Self::None,
            Storage::Send(bytes) => Self::Bytes(bytes),
            Storage::Receive(buffer) => Self::Buffer(buffer),
        }
    }
}

/// An NVMe command or response plus its data.
///
/// Completions surfaced to a host are response capsules: the entry carries
/// the application's original command identifier, the payload is the
/// buffer given at submission, and `transfer_error` says why a transfer
/// failed when the status is not success.
#[derive(Debug, Clone)]
pub struct Capsule {
    entry: Entry,
    payload: Payload,
    allow_immediate: bool,
    transfer_error: Option<TransferError>,
}

impl Capsule {
    pub fn command(sqe: SubmissionEntry) -> Self {
        Self {
            entry: Entry::Command(sqe),
            payload: Payload::None,
            allow_immediate: true,
            transfer_error: None,
        }
    }

    pub fn response(cqe: CompletionEntry) -> Self {
        Self {
            entry: Entry::Response(cqe),
            payload: Payload::None,
            allow_immediate: false,
            transfer_error: None,
        }
    }

    /// Attach bytes to send.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.payload = Payload::Bytes(data.into());
        self
    }

    /// Attach a destination for inbound data.
    pub fn with_buffer(mut self, buffer: DataBuffer) -> Self {
        self.payload = Payload::Buffer(buffer);
        self
    }

    /// Always move data through R2T / H2CData, never in the capsule.
    pub fn without_immediate_data(mut self) -> Self {
        self.allow_immediate = false;
        self
    }

    pub(crate) fn completion(
        cqe: CompletionEntry,
        payload: Payload,
        transfer_error: Option<TransferError>,
    ) -> Self {
        Self {
            entry: Entry::Response(cqe),
            payload,
            allow_immediate: false,
            transfer_error,
        }
    }

    /// Completion for a command that never got a reply from the peer.
    pub(crate) fn failed(cid: u16, payload: Payload, error: TransferError) -> Self {
        Self::completion(
            CompletionEntry::new(cid, error.nvme_status()),
            payload,
            Some(error),
        )
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn sqe(&self) -> Option<&SubmissionEntry> {
        match &self.entry {
            Entry::Command(sqe) => Some(sqe),
            Entry::Response(_) => None,
        }
    }

    pub fn cqe(&self) -> Option<&CompletionEntry> {
        match &self.entry {
            Entry::Response(cqe) => Some(cqe),
            Entry::Command(_) => None,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self.entry, Entry::Command(_))
    }

    /// Command identifier of the carried entry.
    pub fn cid(&self) -> u16 {
        match &self.entry {
            Entry::Command(sqe) => sqe.cid(),
            Entry::Response(cqe) => cqe.cid(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn allows_immediate_data(&self) -> bool {
        self.allow_immediate
    }

    pub fn transfer_error(&self) -> Option<TransferError> {
        self.transfer_error
    }

    /// Response carrying success status.
    pub fn is_success(&self) -> bool {
        self.cqe().is_some_and(|cqe| cqe.is_success())
    }

    /// Total data length the command describes.
    pub fn data_length(&self) -> u32 {
        match &self.entry {
            Entry::Command(sqe) => sqe.sgl_length(),
            Entry::Response(_) => self.payload.len() as u32,
        }
    }
}
