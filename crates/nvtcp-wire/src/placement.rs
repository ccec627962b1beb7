//! Direct-placement engine interface.
//!
//! A placement engine lets the NIC write inbound PDU payload straight into a
//! registered host buffer, keyed by the transfer tag carried in the PDU. The
//! engine itself (page tables, pod programming, TLB invalidation) lives
//! outside this crate; the transport only needs to register a buffer, program
//! the tag-table entry that points at it, and tear both down again.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, WireError};

/// Default placement page size: 4 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// One DMA-visible contiguous piece of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Bus address of the first byte.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
}

/// Scatter list describing where a transfer's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryDescription {
    segments: Vec<Segment>,
}

impl MemoryDescription {
    /// Build from an explicit scatter list.
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// A single contiguous segment.
    pub fn contiguous(addr: u64, len: usize) -> Self {
        Self {
            segments: vec![Segment { addr, len }],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total bytes described.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|seg| seg.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every interior segment boundary falls on a page boundary.
    ///
    /// The first segment may start anywhere and the last may end anywhere;
    /// everything in between must be whole pages so the engine can describe
    /// the buffer as a page list.
    pub fn is_page_aligned(&self, page_size: usize) -> bool {
        let page = page_size as u64;
        let last = self.segments.len().saturating_sub(1);
        self.segments.iter().enumerate().all(|(idx, seg)| {
            let start_ok = idx == 0 || seg.addr % page == 0;
            let end_ok = idx == last || (seg.addr + seg.len as u64) % page == 0;
            start_ok && end_ok
        })
    }

    /// Number of pages the engine needs to map this description.
    pub fn pages_spanned(&self, page_size: usize) -> usize {
        let page = page_size as u64;
        self.segments
            .iter()
            .filter(|seg| seg.len > 0)
            .map(|seg| {
                let first = seg.addr / page;
                let last = (seg.addr + seg.len as u64 - 1) / page;
                (last - first + 1) as usize
            })
            .sum()
    }
}

/// Opaque handle to a registered placement mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlacementHandle(u32);

impl PlacementHandle {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Hardware direct-placement engine.
///
/// `register` may be slow (it programs page pods); callers must not hold
/// locks shared with the receive path while calling it.
pub trait PlacementService: Send + Sync {
    /// Map a buffer so the NIC can place inbound payload into it.
    fn register(&self, desc: &MemoryDescription) -> Result<PlacementHandle>;

    /// Remove a mapping. Unknown handles are ignored.
    fn deregister(&self, handle: PlacementHandle);

    /// Write raw bytes into the device register window.
    fn write_registers(&self, addr: u32, bytes: &[u8]) -> Result<()>;
}

/// Placement engine for hosts without offload hardware: every registration
/// fails, so every transfer falls back to plain tags.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlacement;

impl PlacementService for NoPlacement {
    fn register(&self, _desc: &MemoryDescription) -> Result<PlacementHandle> {
        Err(WireError::PlacementRejected(
            "no placement engine present".to_string(),
        ))
    }

    fn deregister(&self, _handle: PlacementHandle) {}

    fn write_registers(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        Err(WireError::RegisterRange {
            addr,
            len: bytes.len(),
        })
    }
}

/// One programming operation observed by [`SoftwarePlacement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementEvent {
    Registered(PlacementHandle),
    Deregistered(PlacementHandle),
    RegisterWrite { addr: u32, len: usize },
}

/// In-memory placement engine with a bounded mapping table.
///
/// Keeps a log of every programming operation so callers can check that
/// mappings are torn down. Registrations can be made to fail on demand.
pub struct SoftwarePlacement {
    capacity: usize,
    register_window: u32,
    state: Mutex<SoftwareState>,
}

#[derive(Default)]
struct SoftwareState {
    next_handle: u32,
    live: HashMap<PlacementHandle, MemoryDescription>,
    registers: HashMap<u32, Vec<u8>>,
    fail_next: usize,
    events: Vec<PlacementEvent>,
}

impl SoftwarePlacement {
    /// Default register window: 64 KiB.
    pub const DEFAULT_REGISTER_WINDOW: u32 = 64 * 1024;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            register_window: Self::DEFAULT_REGISTER_WINDOW,
            state: Mutex::new(SoftwareState::default()),
        }
    }

    /// Make the next `count` registrations fail.
    pub fn fail_next_registrations(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Number of mappings currently registered.
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_registered(&self, handle: PlacementHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Last bytes written at `addr`, if any.
    pub fn register_value(&self, addr: u32) -> Option<Vec<u8>> {
        self.state.lock().registers.get(&addr).cloned()
    }

    /// Snapshot of the programming log.
    pub fn events(&self) -> Vec<PlacementEvent> {
        self.state.lock().events.clone()
    }
}

impl PlacementService for SoftwarePlacement {
    fn register(&self, desc: &MemoryDescription) -> Result<PlacementHandle> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(WireError::PlacementRejected(
                "injected registration failure".to_string(),
            ));
        }
        if state.live.len() >= self.capacity {
            return Err(WireError::PlacementFull {
                capacity: self.capacity,
            });
        }
        if desc.is_empty() {
            return Err(WireError::PlacementRejected(
                "empty memory description".to_string(),
            ));
        }

        state.next_handle = state.next_handle.wrapping_add(1);
        let handle = PlacementHandle(state.next_handle);
        state.live.insert(handle, desc.clone());
        state.events.push(PlacementEvent::Registered(handle));
        debug!(handle = handle.0, bytes = desc.len(), "placement registered");
        Ok(handle)
    }

    fn deregister(&self, handle: PlacementHandle) {
        let mut state = self.state.lock();
        if state.live.remove(&handle).is_some() {
            state.events.push(PlacementEvent::Deregistered(handle));
            debug!(handle = handle.0, "placement deregistered");
        } else {
            warn!(handle = handle.0, "deregister of unknown placement handle");
        }
    }

    fn write_registers(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        let end = addr as u64 + bytes.len() as u64;
        if end > self.register_window as u64 {
            return Err(WireError::RegisterRange {
                addr,
                len: bytes.len(),
            });
        }
        let mut state = self.state.lock();
        state.registers.insert(addr, bytes.to_vec());
        state.events.push(PlacementEvent::RegisterWrite {
            addr,
            len: bytes.len(),
        });
        Ok(())
    }
}
