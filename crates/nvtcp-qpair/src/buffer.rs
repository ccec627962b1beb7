use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nvtcp_pdu::types::field;
use nvtcp_pdu::FatalErrorStatus;
use nvtcp_wire::MemoryDescription;
use parking_lot::Mutex;

use crate::capsule::Capsule;
use crate::error::TransferError;
use crate::tag::Tag;

/// Destination memory for inbound data.
///
/// Cloning shares the storage: the application keeps one handle, the queue
/// pair fills another. The storage never grows or moves, so its address is
/// stable for a placement mapping.
#[derive(Clone)]
pub struct DataBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl DataBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` in at `offset`. Returns `false` if it does not fit.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        match inner.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Address range the storage occupies, for placement registration.
    pub fn memory(&self) -> MemoryDescription {
        let inner = self.inner.lock();
        MemoryDescription::contiguous(inner.as_ptr() as u64, inner.len())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer").field("len", &self.len()).finish()
    }
}

/// Where a transfer's bytes come from or go to.
#[derive(Debug, Clone)]
pub enum Storage {
    /// No data (a command that needed a tag only to route its response).
    None,
    /// Outbound bytes.
    Send(Bytes),
    /// Inbound destination.
    Receive(DataBuffer),
}

/// Rule a data PDU or R2T broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFault {
    /// Offset is not where the transfer left off.
    Offset { expected: u32, actual: u32 },
    /// Range extends outside the transfer window.
    OutOfRange { offset: u32, length: u32 },
    /// LAST_PDU set on a PDU that does not finish the transfer, or missing
    /// on one that does.
    LastFlag { last: bool, complete: bool },
    /// Zero-length grant or data.
    Empty,
    /// Payload reported as placed by hardware on a tag with no mapping.
    PlacedWithoutMapping { offset: u32 },
}

impl DataFault {
    /// Termination reason and field offset to report.
    pub fn termination(&self) -> (FatalErrorStatus, u32) {
        match self {
            Self::Offset { .. } => (FatalErrorStatus::PduSequenceError, field::DATAO),
            Self::OutOfRange { .. } => (FatalErrorStatus::DataTransferOutOfRange, field::DATAL),
            Self::LastFlag { .. } => (FatalErrorStatus::PduSequenceError, field::FLAGS),
            Self::Empty => (FatalErrorStatus::InvalidHeaderField, field::DATAL),
            Self::PlacedWithoutMapping { .. } => {
                (FatalErrorStatus::PduSequenceError, field::CCCID)
            }
        }
    }
}

impl fmt::Display for DataFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset { expected, actual } => {
                write!(f, "data offset {actual}, expected {expected}")
            }
            Self::OutOfRange { offset, length } => {
                write!(f, "range {offset}+{length} outside transfer")
            }
            Self::LastFlag { last, complete } => {
                write!(f, "last flag {last} but transfer complete {complete}")
            }
            Self::Empty => f.write_str("zero-length transfer"),
            Self::PlacedWithoutMapping { offset } => {
                write!(f, "data at {offset} placed on a tag without a mapping")
            }
        }
    }
}

/// One data transfer tracked by a registry.
#[derive(Debug)]
pub struct CommandBuffer {
    pub tag: Tag,
    /// Identifier the application used; restored on completion.
    pub original_cid: u16,
    /// First byte of the window this buffer covers, relative to the command.
    pub offset: u32,
    /// Requested length of the window.
    pub length: u32,
    transferred: u32,
    placed_without_pdu: u32,
    pub error: Option<TransferError>,
    pub storage: Storage,
    /// Command that issued this transfer (controller side).
    pub capsule: Option<Arc<Capsule>>,
    /// Transfer tag from the most recent R2T (host writes).
    pub ttag: u16,
}

impl CommandBuffer {
    pub fn new(tag: Tag, original_cid: u16, offset: u32, length: u32, storage: Storage) -> Self {
        Self {
            tag,
            original_cid,
            offset,
            length,
            transferred: 0,
            placed_without_pdu: 0,
            error: None,
            storage,
            capsule: None,
            ttag: 0,
        }
    }

    pub fn with_capsule(mut self, capsule: Arc<Capsule>) -> Self {
        self.capsule = Some(capsule);
        self
    }

    /// Bytes moved so far, including bytes placed without a PDU.
    pub fn transferred(&self) -> u32 {
        self.transferred
    }

    /// Bytes the NIC placed that never arrived as PDUs.
    pub fn placed_without_pdu(&self) -> u32 {
        self.placed_without_pdu
    }

    pub fn is_complete(&self) -> bool {
        self.transferred == self.length
    }

    /// Mark a transfer that needs no further data movement.
    pub fn mark_complete(&mut self) {
        self.transferred = self.length;
    }

    fn window_end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    /// Account one inbound data PDU. Returns whether the window is now full.
    ///
    /// `data` is copied into the destination unless the payload was placed
    /// by hardware (`placed`).
    pub fn accept_data(
        &mut self,
        datao: u32,
        datal: u32,
        last: bool,
        placed: bool,
        data: &[u8],
    ) -> Result<bool, DataFault> {
        if datal == 0 {
            return Err(DataFault::Empty);
        }
        if placed && !self.tag.is_accelerated() {
            return Err(DataFault::PlacedWithoutMapping { offset: datao });
        }
        if datao < self.offset || datao as u64 + datal as u64 > self.window_end() {
            return Err(DataFault::OutOfRange {
                offset: datao,
                length: datal,
            });
        }
        let expected = self.offset + self.transferred;
        if datao != expected {
            if datao > expected && self.tag.is_accelerated() {
                // Placed by the NIC without a PDU reaching us.
                let gap = datao - expected;
                self.placed_without_pdu += gap;
                self.transferred += gap;
            } else {
                return Err(DataFault::Offset {
                    expected,
                    actual: datao,
                });
            }
        }

        if !placed && !data.is_empty() {
            if let Storage::Receive(buffer) = &self.storage {
                if !buffer.write_at((datao - self.offset) as usize, data) {
                    return Err(DataFault::OutOfRange {
                        offset: datao,
                        length: datal,
                    });
                }
            }
        }
        self.transferred += datal;

        let complete = self.is_complete();
        if last != complete {
            return Err(DataFault::LastFlag { last, complete });
        }
        Ok(complete)
    }

    /// Account an R2T grant for an outbound transfer.
    pub fn accept_grant(&mut self, r2to: u32, r2tl: u32) -> Result<(), DataFault> {
        if r2tl == 0 {
            return Err(DataFault::Empty);
        }
        if r2to != self.transferred {
            return Err(DataFault::Offset {
                expected: self.transferred,
                actual: r2to,
            });
        }
        if r2to as u64 + r2tl as u64 > self.length as u64 {
            return Err(DataFault::OutOfRange {
                offset: r2to,
                length: r2tl,
            });
        }
        self.transferred += r2tl;
        Ok(())
    }
}
