//! Command buffers keyed by wire identifier.
//!
//! A host keys both registries by the tag it put in the command's CID; a
//! controller keys its receive registry by the TTAG it put in the R2T.
//! Lock order is receive registry, then transmit registry.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::buffer::CommandBuffer;

/// Which registry a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Inbound data (host reads, controller R2T receives).
    Receive,
    /// Outbound data (host writes).
    Transmit,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<u16, CommandBuffer>,
    closed: bool,
}

/// One side's command buffers.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `buffer` under `key`. Hands the buffer back if the registry is
    /// closed or the key is taken.
    pub fn insert(&self, key: u16, buffer: CommandBuffer) -> Result<(), CommandBuffer> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.buffers.contains_key(&key) {
            return Err(buffer);
        }
        inner.buffers.insert(key, buffer);
        Ok(())
    }

    pub fn remove(&self, key: u16) -> Option<CommandBuffer> {
        self.inner.lock().buffers.remove(&key)
    }

    /// Run `f` on the buffer under `key` while the registry is locked.
    pub fn with<R>(&self, key: u16, f: impl FnOnce(&mut CommandBuffer) -> R) -> Option<R> {
        self.inner.lock().buffers.get_mut(&key).map(f)
    }

    pub fn contains(&self, key: u16) -> bool {
        self.inner.lock().buffers.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further inserts and hand back every buffer.
    pub fn close(&self) -> Vec<CommandBuffer> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut buffers: Vec<(u16, CommandBuffer)> = inner.buffers.drain().collect();
        buffers.sort_by_key(|(key, _)| *key);
        buffers.into_iter().map(|(_, buffer)| buffer).collect()
    }
}

/// Receive and transmit registries of one queue pair.
#[derive(Default)]
pub struct Registries {
    pub rx: Registry,
    pub tx: Registry,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn side(&self, side: Side) -> &Registry {
        match side {
            Side::Receive => &self.rx,
            Side::Transmit => &self.tx,
        }
    }

    /// Remove the buffer under `key` from whichever registry holds it,
    /// receive side first.
    pub fn take(&self, key: u16) -> Option<(Side, CommandBuffer)> {
        let mut rx = self.rx.inner.lock();
        if let Some(buffer) = rx.buffers.remove(&key) {
            return Some((Side::Receive, buffer));
        }
        let mut tx = self.tx.inner.lock();
        tx.buffers
            .remove(&key)
            .map(|buffer| (Side::Transmit, buffer))
    }

    pub fn is_empty(&self) -> bool {
        let rx = self.rx.inner.lock();
        let tx = self.tx.inner.lock();
        rx.buffers.is_empty() && tx.buffers.is_empty()
    }

    /// Close both registries and hand back every buffer, receive side first.
    pub fn close(&self) -> Vec<CommandBuffer> {
        let mut buffers = self.rx.close();
        buffers.extend(self.tx.close());
        buffers
    }
}
