//! Transfer tag allocation.
//!
//! Two tag kinds share one 16-bit wire space. Accelerated tags index a small
//! table of hardware placement mappings and occupy `0x0000..0x8000`; plain
//! tags (payload copied by software) carry the high bit. Command identifiers
//! sent unchanged (pass-through) are claimed in the same space, so every live
//! wire value has exactly one owner.

use std::collections::HashSet;
use std::sync::Arc;

use nvtcp_wire::{MemoryDescription, PlacementHandle, PlacementService};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Wire bit that marks a plain tag.
pub const PLAIN_TAG_BIT: u16 = 0x8000;

pub const MAX_PLAIN_TAGS: usize = 0x8000;
pub const MAX_ACCELERATED_TAGS: usize = 0x8000;

/// Base of the tag table in the placement engine's register window.
pub const TAG_TABLE_BASE: u32 = 0x1000;

/// One tag-table entry: placement handle and mapped length, both `u32` LE.
pub const TAG_TABLE_ENTRY_SIZE: u32 = 8;

/// Transfer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Payload placed by hardware into a registered buffer.
    Accelerated(u16),
    /// Payload copied by software.
    Plain(u16),
}

impl Tag {
    /// Value carried in the PDU's CID or TTAG field.
    pub fn wire(self) -> u16 {
        match self {
            Self::Accelerated(idx) => idx & !PLAIN_TAG_BIT,
            Self::Plain(idx) => idx | PLAIN_TAG_BIT,
        }
    }

    pub fn from_wire(value: u16) -> Self {
        if value & PLAIN_TAG_BIT != 0 {
            Self::Plain(value & !PLAIN_TAG_BIT)
        } else {
            Self::Accelerated(value)
        }
    }

    pub fn is_accelerated(self) -> bool {
        matches!(self, Self::Accelerated(_))
    }

    pub fn index(self) -> u16 {
        match self {
            Self::Accelerated(idx) | Self::Plain(idx) => idx,
        }
    }
}

/// Register address of an accelerated slot's tag-table entry.
pub fn tag_table_addr(index: u16) -> u32 {
    TAG_TABLE_BASE + index as u32 * TAG_TABLE_ENTRY_SIZE
}

/// Buffer properties a placement mapping needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligibility {
    pub ddp_threshold: usize,
    pub page_size: usize,
    pub max_pages: usize,
}

impl Eligibility {
    pub fn allows(&self, desc: &MemoryDescription) -> bool {
        desc.len() >= self.ddp_threshold
            && desc.is_page_aligned(self.page_size)
            && desc.pages_spanned(self.page_size) <= self.max_pages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    /// Claimed while placement is being programmed or torn down.
    Busy,
    Live(PlacementHandle),
}

struct Pools {
    accelerated: Vec<Slot>,
    accel_cursor: usize,
    plain: Vec<bool>,
    plain_cursor: usize,
    passthrough: HashSet<u16>,
    closed: bool,
}

impl Pools {
    fn wire_in_use(&self, wire: u16) -> bool {
        if self.passthrough.contains(&wire) {
            return true;
        }
        match Tag::from_wire(wire) {
            Tag::Accelerated(idx) => self
                .accelerated
                .get(idx as usize)
                .is_some_and(|slot| *slot != Slot::Free),
            Tag::Plain(idx) => self.plain.get(idx as usize).copied().unwrap_or(false),
        }
    }
}

/// Hands out accelerated and plain tags and tracks pass-through identifiers.
///
/// The pool lock is a leaf: placement programming happens after it is
/// released, and callers never hold a registry lock across these calls.
pub struct TagAllocator {
    pools: Mutex<Pools>,
    placement: Arc<dyn PlacementService>,
    eligibility: Eligibility,
}

impl TagAllocator {
    pub fn new(
        accelerated: usize,
        plain: usize,
        placement: Arc<dyn PlacementService>,
        eligibility: Eligibility,
    ) -> Self {
        Self {
            pools: Mutex::new(Pools {
                accelerated: vec![Slot::Free; accelerated.min(MAX_ACCELERATED_TAGS)],
                accel_cursor: 0,
                plain: vec![false; plain.min(MAX_PLAIN_TAGS)],
                plain_cursor: 0,
                passthrough: HashSet::new(),
                closed: false,
            }),
            placement,
            eligibility,
        }
    }

    pub fn eligibility(&self) -> &Eligibility {
        &self.eligibility
    }

    /// Reserve an accelerated slot and map `desc` for direct placement.
    ///
    /// Returns `None` when the buffer is ineligible, no slot is free, or
    /// programming the engine fails. Slots are handed out round-robin.
    pub fn allocate_accelerated(&self, desc: &MemoryDescription) -> Option<Tag> {
        if !self.eligibility.allows(desc) {
            debug!(bytes = desc.len(), "buffer not eligible for placement");
            return None;
        }

        let idx = {
            let mut pools = self.pools.lock();
            if pools.closed {
                return None;
            }
            let count = pools.accelerated.len();
            let start = pools.accel_cursor;
            let found = (0..count).map(|step| (start + step) % count).find(|&idx| {
                pools.accelerated[idx] == Slot::Free && !pools.passthrough.contains(&(idx as u16))
            })?;
            pools.accelerated[found] = Slot::Busy;
            pools.accel_cursor = (found + 1) % count;
            found as u16
        };

        let handle = match self.placement.register(desc) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(slot = idx, error = %err, "placement registration failed");
                self.release_slot(idx);
                return None;
            }
        };
        let mut entry = [0u8; TAG_TABLE_ENTRY_SIZE as usize];
        entry[..4].copy_from_slice(&handle.raw().to_le_bytes());
        entry[4..].copy_from_slice(&(desc.len() as u32).to_le_bytes());
        if let Err(err) = self.placement.write_registers(tag_table_addr(idx), &entry) {
            warn!(slot = idx, error = %err, "tag table write failed");
            self.placement.deregister(handle);
            self.release_slot(idx);
            return None;
        }

        self.pools.lock().accelerated[idx as usize] = Slot::Live(handle);
        debug!(slot = idx, handle = handle.raw(), "accelerated tag allocated");
        Some(Tag::Accelerated(idx))
    }

    /// Take the lowest free plain tag at or after the cursor.
    pub fn allocate_plain(&self) -> Option<Tag> {
        let mut pools = self.pools.lock();
        if pools.closed {
            return None;
        }
        let count = pools.plain.len();
        let start = pools.plain_cursor;
        let idx = (0..count).map(|step| (start + step) % count).find(|&idx| {
            !pools.plain[idx] && !pools.passthrough.contains(&(idx as u16 | PLAIN_TAG_BIT))
        })?;
        pools.plain[idx] = true;
        pools.plain_cursor = (idx + 1) % count;
        Some(Tag::Plain(idx as u16))
    }

    /// Release a tag. Returns `false` (and changes nothing) if it was not live.
    pub fn free(&self, tag: Tag) -> bool {
        match tag {
            Tag::Plain(idx) => {
                let mut pools = self.pools.lock();
                match pools.plain.get_mut(idx as usize) {
                    Some(live) if *live => {
                        *live = false;
                        true
                    }
                    _ => {
                        warn!(?tag, "free of tag that is not live");
                        false
                    }
                }
            }
            Tag::Accelerated(idx) => {
                let handle = {
                    let mut pools = self.pools.lock();
                    match pools.accelerated.get_mut(idx as usize) {
                        Some(slot) => match *slot {
                            Slot::Live(handle) => {
                                *slot = Slot::Busy;
                                handle
                            }
                            _ => {
                                warn!(?tag, "free of tag that is not live");
                                return false;
                            }
                        },
                        None => {
                            warn!(?tag, "free of tag outside the pool");
                            return false;
                        }
                    }
                };

                let cleared = [0u8; TAG_TABLE_ENTRY_SIZE as usize];
                if let Err(err) = self.placement.write_registers(tag_table_addr(idx), &cleared) {
                    warn!(slot = idx, error = %err, "tag table clear failed");
                }
                self.placement.deregister(handle);
                self.release_slot(idx);
                debug!(slot = idx, "accelerated tag freed");
                true
            }
        }
    }

    fn release_slot(&self, idx: u16) {
        if let Some(slot) = self.pools.lock().accelerated.get_mut(idx as usize) {
            *slot = Slot::Free;
        }
    }

    /// Record `cid` as sent unchanged. Refused if the value is already owned.
    pub fn claim_passthrough(&self, cid: u16) -> bool {
        let mut pools = self.pools.lock();
        if pools.closed || pools.wire_in_use(cid) {
            return false;
        }
        pools.passthrough.insert(cid)
    }

    pub fn release_passthrough(&self, cid: u16) -> bool {
        self.pools.lock().passthrough.remove(&cid)
    }

    pub fn passthrough_count(&self) -> usize {
        self.pools.lock().passthrough.len()
    }

    /// Refuse further allocations and claims; hand back outstanding
    /// pass-through identifiers. Live tags stay live until freed.
    pub fn close(&self) -> Vec<u16> {
        let mut pools = self.pools.lock();
        pools.closed = true;
        let mut cids: Vec<u16> = pools.passthrough.drain().collect();
        cids.sort_unstable();
        cids
    }

    pub fn is_live(&self, tag: Tag) -> bool {
        let pools = self.pools.lock();
        match tag {
            Tag::Accelerated(idx) => matches!(
                pools.accelerated.get(idx as usize),
                Some(Slot::Live(_))
            ),
            Tag::Plain(idx) => pools.plain.get(idx as usize).copied().unwrap_or(false),
        }
    }

    /// Live tags of both kinds.
    pub fn live_count(&self) -> usize {
        let pools = self.pools.lock();
        pools
            .accelerated
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
            + pools.plain.iter().filter(|live| **live).count()
    }

    /// Placement handle behind a live accelerated tag.
    pub fn placement_handle(&self, tag: Tag) -> Option<PlacementHandle> {
        let Tag::Accelerated(idx) = tag else {
            return None;
        };
        match self.pools.lock().accelerated.get(idx as usize) {
            Some(Slot::Live(handle)) => Some(*handle),
            _ => None,
        }
    }
}
