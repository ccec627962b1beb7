use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use nvtcp_pdu::{DataPdu, Pdu, PduConfig, PduReader, PduSink, PduSource, PduWriter, R2t};
use nvtcp_wire::{PlacementService, WireControl, WireError, WireStream};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::{CommandBuffer, DataBuffer, Storage};
use crate::capsule::{Capsule, Payload};
use crate::config::{QueuePairConfig, Role};
use crate::dispatch::{DispatchState, Dispatcher};
use crate::error::{QpairError, Result, TransferError};
use crate::registry::Registries;
use crate::tag::{Eligibility, TagAllocator};
use crate::transmit::{Transmitter, TxItem};

/// Application side of a queue pair.
///
/// Callbacks run on the queue pair's own threads; they must not block on
/// the queue pair they were called from (for example by calling
/// [`QueuePair::close`]).
pub trait CapsuleHandler: Send + Sync {
    /// A command arrived (controller) or a command completed (host).
    fn capsule_received(&self, capsule: Arc<Capsule>);

    /// A controller receive started with
    /// [`QueuePair::receive_controller_data`] finished.
    fn data_received(
        &self,
        capsule: Arc<Capsule>,
        buffer: DataBuffer,
        result: std::result::Result<(), TransferError>,
    ) {
        let _ = (capsule, buffer, result);
    }

    /// The connection failed. Called at most once.
    fn connection_error(&self, error: QpairError);
}

/// Handler callbacks as channel messages.
#[derive(Debug)]
pub enum QpairEvent {
    Capsule(Arc<Capsule>),
    Data {
        capsule: Arc<Capsule>,
        buffer: DataBuffer,
        result: std::result::Result<(), TransferError>,
    },
    ConnectionError(QpairError),
}

impl CapsuleHandler for mpsc::Sender<QpairEvent> {
    fn capsule_received(&self, capsule: Arc<Capsule>) {
        let _ = self.send(QpairEvent::Capsule(capsule));
    }

    fn data_received(
        &self,
        capsule: Arc<Capsule>,
        buffer: DataBuffer,
        result: std::result::Result<(), TransferError>,
    ) {
        let _ = self.send(QpairEvent::Data {
            capsule,
            buffer,
            result,
        });
    }

    fn connection_error(&self, error: QpairError) {
        let _ = self.send(QpairEvent::ConnectionError(error));
    }
}

#[derive(Default)]
struct R2tWindow {
    outstanding: usize,
    pending: VecDeque<R2t>,
}

/// State shared by the application handle and both loops.
pub(crate) struct Shared {
    pub(crate) config: QueuePairConfig,
    pub(crate) pdu_config: PduConfig,
    pub(crate) tags: TagAllocator,
    pub(crate) registries: Registries,
    pub(crate) queued: AtomicUsize,
    pub(crate) control: Arc<dyn WireControl>,
    state: Mutex<DispatchState>,
    queue: mpsc::Sender<TxItem>,
    r2t: Mutex<R2tWindow>,
    /// Controller commands surfaced to the application and not yet answered.
    unanswered: Mutex<HashSet<u16>>,
    handler: Arc<dyn CapsuleHandler>,
}

impl Shared {
    fn new(
        config: QueuePairConfig,
        queue: mpsc::Sender<TxItem>,
        placement: Arc<dyn PlacementService>,
        handler: Arc<dyn CapsuleHandler>,
        control: Arc<dyn WireControl>,
    ) -> Self {
        let tags = TagAllocator::new(
            config.accelerated_tags as usize,
            config.plain_tags as usize,
            placement,
            Eligibility {
                ddp_threshold: config.ddp_threshold as usize,
                page_size: config.page_size,
                max_pages: config.max_placement_pages,
            },
        );
        Self {
            pdu_config: config.pdu_config(),
            config,
            tags,
            registries: Registries::new(),
            queued: AtomicUsize::new(0),
            control,
            state: Mutex::new(DispatchState::Idle),
            queue,
            r2t: Mutex::new(R2tWindow::default()),
            unanswered: Mutex::new(HashSet::new()),
            handler,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn role(&self) -> Role {
        self.config.role
    }

    pub(crate) fn state(&self) -> DispatchState {
        *self.state.lock()
    }

    /// Still moving data (not terminating or closed).
    pub(crate) fn accepting(&self) -> bool {
        matches!(
            self.state(),
            DispatchState::Idle | DispatchState::Draining
        )
    }

    /// Queue a capsule if the current state allows it.
    fn submit(&self, capsule: Capsule, allow_draining: bool) -> Result<()> {
        let state = self.state.lock();
        match *state {
            DispatchState::Idle => {}
            DispatchState::Draining if allow_draining => {}
            DispatchState::Draining => return Err(QpairError::Draining),
            DispatchState::Terminating | DispatchState::Closed => return Err(QpairError::Closed),
        }
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(TxItem::Capsule(capsule)).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(QpairError::Closed);
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, pdu: Pdu) {
        if self.queue.send(TxItem::Pdu(pdu)).is_err() {
            debug!(qpair = %self.name(), "transmit loop gone; PDU dropped");
        }
    }

    pub(crate) fn enqueue_termination(&self, pdu: Pdu) {
        if self.queue.send(TxItem::Terminate(pdu)).is_err() {
            debug!(qpair = %self.name(), "transmit loop gone; termination request dropped");
        }
    }

    /// Move to Terminating. Returns `false` if already terminating or closed.
    pub(crate) fn enter_terminating(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            DispatchState::Idle | DispatchState::Draining => {
                *state = DispatchState::Terminating;
                true
            }
            DispatchState::Terminating | DispatchState::Closed => false,
        }
    }

    fn begin_drain(&self) -> bool {
        let mut state = self.state.lock();
        if *state != DispatchState::Idle {
            return false;
        }
        *state = DispatchState::Draining;
        true
    }

    /// Close cleanly once a drain has nothing left in flight.
    pub(crate) fn maybe_finish_drain(&self) {
        if self.state() != DispatchState::Draining {
            return;
        }
        let idle = self.queued.load(Ordering::Acquire) == 0
            && self.registries.is_empty()
            && self.tags.passthrough_count() == 0
            && self.r2t.lock().pending.is_empty()
            && self.unanswered.lock().is_empty();
        if idle {
            info!(qpair = %self.name(), "drain complete");
            self.teardown(None);
        }
    }

    /// Close the connection and resolve everything in flight. Only the first
    /// call does anything; it reports `reason` (if any) to the handler.
    pub(crate) fn teardown(&self, reason: Option<QpairError>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if *state == DispatchState::Closed {
                return false;
            }
            std::mem::replace(&mut *state, DispatchState::Closed)
        };
        match &reason {
            Some(err) => warn!(qpair = %self.name(), error = %err, "queue pair closing"),
            None => info!(qpair = %self.name(), "queue pair closing"),
        }

        let _ = self.queue.send(TxItem::Shutdown);
        // A queued termination request goes out first; the transmit loop
        // shuts the stream down after writing it.
        if previous != DispatchState::Terminating {
            self.control.shutdown();
        }

        let passthrough = self.tags.close();
        for buffer in self.registries.close() {
            self.abort_buffer(buffer);
        }
        if self.role() == Role::Host {
            for cid in passthrough {
                self.surface(Capsule::failed(
                    cid,
                    Payload::None,
                    TransferError::ConnectionAborted,
                ));
            }
        }
        self.r2t.lock().pending.clear();
        self.unanswered.lock().clear();

        if let Some(reason) = reason {
            self.handler.connection_error(reason);
        }
        true
    }

    /// Resolve a buffer that will never finish.
    pub(crate) fn abort_buffer(&self, buffer: CommandBuffer) {
        self.tags.free(buffer.tag);
        match self.role() {
            Role::Host => self.surface(Capsule::failed(
                buffer.original_cid,
                buffer.storage.into(),
                TransferError::ConnectionAborted,
            )),
            Role::Controller => {
                if let (Some(capsule), Storage::Receive(data)) = (buffer.capsule, buffer.storage) {
                    self.handler
                        .data_received(capsule, data, Err(TransferError::ConnectionAborted));
                }
            }
        }
    }

    /// Resolve a capsule that was queued but never transmitted.
    pub(crate) fn abort_capsule(&self, capsule: Capsule) {
        if !capsule.is_command() {
            debug!(qpair = %self.name(), cid = capsule.cid(), "response dropped at shutdown");
            return;
        }
        let cid = capsule.cid();
        self.surface(Capsule::failed(
            cid,
            capsule.into_payload(),
            TransferError::ConnectionAborted,
        ));
    }

    /// A command was handed to the controller application.
    pub(crate) fn command_surfaced(&self, cid: u16) {
        self.unanswered.lock().insert(cid);
    }

    /// The response for `cid`, or a C2HData PDU standing in for it, was
    /// written.
    pub(crate) fn command_answered(&self, cid: u16) {
        let removed = self.unanswered.lock().remove(&cid);
        if removed {
            self.maybe_finish_drain();
        }
    }

    pub(crate) fn surface(&self, capsule: Capsule) {
        self.handler.capsule_received(Arc::new(capsule));
    }

    pub(crate) fn data_received(
        &self,
        capsule: Arc<Capsule>,
        buffer: DataBuffer,
        result: std::result::Result<(), TransferError>,
    ) {
        self.handler.data_received(capsule, buffer, result);
    }

    /// Send an R2T now or hold it until an outstanding one finishes.
    fn grant_r2t(&self, r2t: R2t) {
        let mut window = self.r2t.lock();
        if window.outstanding < self.config.max_outstanding_r2t as usize {
            window.outstanding += 1;
            drop(window);
            self.enqueue(Pdu::R2T(r2t));
        } else {
            debug!(qpair = %self.name(), ttag = r2t.ttag, "R2T held back");
            window.pending.push_back(r2t);
        }
    }

    /// One R2T grant finished; release the next held one.
    pub(crate) fn r2t_done(&self) {
        let next = {
            let mut window = self.r2t.lock();
            window.outstanding = window.outstanding.saturating_sub(1);
            let next = window.pending.pop_front();
            if next.is_some() {
                window.outstanding += 1;
            }
            next
        };
        if let Some(r2t) = next {
            self.enqueue(Pdu::R2T(r2t));
        }
    }
}

/// One NVMe/TCP connection: a receive loop and a transmit loop sharing tag
/// and command-buffer state.
pub struct QueuePair {
    shared: Arc<Shared>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
}

impl QueuePair {
    /// Start a queue pair over an established stream.
    pub fn spawn(
        config: QueuePairConfig,
        stream: WireStream,
        placement: Arc<dyn PlacementService>,
        handler: Arc<dyn CapsuleHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let reader = PduReader::with_config_wire(stream.try_clone()?, config.max_pdu_size, None)?;
        let control: Arc<dyn WireControl> = Arc::new(stream.try_clone()?);
        let writer = PduWriter::with_config_wire(stream, config.pdu_config(), None)?;
        Self::spawn_with(
            config,
            Box::new(reader),
            Box::new(writer),
            control,
            placement,
            handler,
        )
    }

    /// Start a queue pair over explicit PDU endpoints, such as a NIC receive
    /// path that reports placement status per PDU.
    pub fn spawn_with(
        config: QueuePairConfig,
        source: Box<dyn PduSource>,
        sink: Box<dyn PduSink>,
        control: Arc<dyn WireControl>,
        placement: Arc<dyn PlacementService>,
        handler: Arc<dyn CapsuleHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::channel();
        let name = config.name.clone();
        let shared = Arc::new(Shared::new(config, queue_tx, placement, handler, control));

        let tx_thread = {
            let transmitter = Transmitter::new(Arc::clone(&shared), sink, queue_rx);
            thread::Builder::new()
                .name(format!("{name}-tx"))
                .spawn(move || transmitter.run())
                .map_err(|err| QpairError::Wire(WireError::Io(err)))?
        };
        let rx_thread = {
            let dispatcher = Dispatcher::new(Arc::clone(&shared), source);
            match thread::Builder::new()
                .name(format!("{name}-rx"))
                .spawn(move || dispatcher.run())
            {
                Ok(handle) => handle,
                Err(err) => {
                    shared.teardown(None);
                    let _ = tx_thread.join();
                    return Err(QpairError::Wire(WireError::Io(err)));
                }
            }
        };

        info!(qpair = %name, role = %shared.role(), "queue pair started");
        Ok(Self {
            shared,
            rx_thread: Some(rx_thread),
            tx_thread: Some(tx_thread),
        })
    }

    pub fn config(&self) -> &QueuePairConfig {
        &self.shared.config
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    pub fn state(&self) -> DispatchState {
        self.shared.state()
    }

    /// Queue a capsule for transmission.
    ///
    /// A host submits commands; write data goes in [`Payload::Bytes`], read
    /// destinations in [`Payload::Buffer`]. A controller submits responses.
    /// The outcome of a host command arrives through
    /// [`CapsuleHandler::capsule_received`].
    pub fn submit_capsule(&self, capsule: Capsule) -> Result<()> {
        match (self.role(), capsule.sqe()) {
            (Role::Host, Some(sqe)) => {
                check_payload_direction(sqe, capsule.payload())?;
                check_payload_length(capsule.payload())?;
                self.shared.submit(capsule, false)
            }
            (Role::Controller, None) => self.shared.submit(capsule, true),
            (role, _) => Err(QpairError::WrongRole {
                operation: if capsule.is_command() {
                    "submitting a command"
                } else {
                    "submitting a response"
                },
                role,
            }),
        }
    }

    /// Ask the host for `buffer.len()` bytes of `capsule`'s data starting at
    /// `offset`. The result arrives through [`CapsuleHandler::data_received`].
    pub fn receive_controller_data(
        &self,
        capsule: &Arc<Capsule>,
        offset: u32,
        buffer: DataBuffer,
    ) -> Result<()> {
        self.require_role(Role::Controller, "receive_controller_data")?;
        self.require_open()?;
        let sqe = capsule
            .sqe()
            .ok_or_else(|| QpairError::InvalidCapsule("not a command capsule".to_string()))?;
        let length = transfer_length(buffer.len())?;
        check_range(offset, length, sqe.sgl_length())?;

        let tags = &self.shared.tags;
        let tag = tags
            .allocate_accelerated(&buffer.memory())
            .or_else(|| tags.allocate_plain())
            .ok_or(QpairError::TagsExhausted)?;
        let cid = sqe.cid();
        let entry = CommandBuffer::new(tag, cid, offset, length, Storage::Receive(buffer))
            .with_capsule(Arc::clone(capsule));
        if let Err(entry) = self.shared.registries.rx.insert(tag.wire(), entry) {
            tags.free(entry.tag);
            return Err(QpairError::Closed);
        }

        debug!(qpair = %self.shared.name(), cid, ?tag, offset, length, "requesting host data");
        self.shared.grant_r2t(R2t {
            cccid: cid,
            ttag: tag.wire(),
            offset,
            length,
        });
        Ok(())
    }

    /// Send `data` as `capsule`'s data starting at `offset`, split into
    /// C2HData PDUs of at most `max_c2h_data` bytes.
    ///
    /// The PDU that reaches the command's data length carries LAST_PDU, and
    /// SUCCESS when `c2h_success` is configured (no response capsule follows).
    pub fn send_controller_data(&self, capsule: &Capsule, offset: u32, data: Bytes) -> Result<()> {
        self.require_role(Role::Controller, "send_controller_data")?;
        self.require_open()?;
        let sqe = capsule
            .sqe()
            .ok_or_else(|| QpairError::InvalidCapsule("not a command capsule".to_string()))?;
        let length = transfer_length(data.len())?;
        let total = sqe.sgl_length();
        check_range(offset, length, total)?;

        let end = offset + length;
        let finishes = end == total;
        let max = self.shared.config.max_c2h_data;
        let mut at = offset;
        while at < end {
            let chunk = max.min(end - at);
            let last = finishes && at + chunk == end;
            let start = (at - offset) as usize;
            self.shared.enqueue(Pdu::C2HData(DataPdu {
                cccid: sqe.cid(),
                ttag: 0,
                offset: at,
                length: chunk,
                last,
                success: last && self.shared.config.c2h_success,
                data: data.slice(start..start + chunk as usize),
            }));
            at += chunk;
        }
        Ok(())
    }

    /// Stop accepting new commands and close once nothing is in flight.
    pub fn drain(&self) {
        if self.shared.begin_drain() {
            info!(qpair = %self.shared.name(), "draining");
        }
        self.shared.maybe_finish_drain();
    }

    /// Close the connection without waiting for the loops to exit.
    pub fn shutdown(&self) {
        self.shared.teardown(None);
    }

    /// Wait for both loops to exit.
    pub fn join(&mut self) {
        for handle in [self.rx_thread.take(), self.tx_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!(qpair = %self.shared.name(), "queue pair thread panicked");
            }
        }
    }

    /// Close the connection and wait for both loops to exit.
    pub fn close(mut self) {
        self.shutdown();
        self.join();
    }

    /// Command buffers currently tracked (both registries).
    pub fn outstanding(&self) -> usize {
        self.shared.registries.rx.len() + self.shared.registries.tx.len()
    }

    /// Live transfer tags.
    pub fn live_tags(&self) -> usize {
        self.shared.tags.live_count()
    }

    fn require_role(&self, role: Role, operation: &'static str) -> Result<()> {
        if self.role() != role {
            return Err(QpairError::WrongRole {
                operation,
                role: self.role(),
            });
        }
        Ok(())
    }

    fn require_open(&self) -> Result<()> {
        if self.shared.accepting() {
            Ok(())
        } else {
            Err(QpairError::Closed)
        }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.shared.teardown(None);
        self.join();
    }
}

fn check_payload_direction(sqe: &nvtcp_pdu::SubmissionEntry, payload: &Payload) -> Result<()> {
    use nvtcp_pdu::DataDirection;
    match (sqe.data_direction(), payload) {
        (_, Payload::None)
        | (DataDirection::HostToController, Payload::Bytes(_))
        | (DataDirection::ControllerToHost, Payload::Buffer(_)) => Ok(()),
        (direction, _) => Err(QpairError::InvalidCapsule(format!(
            "payload does not match {direction:?} command"
        ))),
    }
}

/// A payload length as carried in an SGL descriptor.
pub(crate) fn transfer_length(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| QpairError::InvalidCapsule(format!("{len}-byte transfer exceeds 4 GiB")))
}

fn check_payload_length(payload: &Payload) -> Result<()> {
    match payload {
        Payload::None => Ok(()),
        Payload::Bytes(data) => transfer_length(data.len()).map(drop),
        Payload::Buffer(dest) => transfer_length(dest.len()).map(drop),
    }
}

fn check_range(offset: u32, length: u32, total: u32) -> Result<()> {
    if length == 0 {
        return Err(QpairError::InvalidCapsule("empty transfer".to_string()));
    }
    if offset as u64 + length as u64 > total as u64 {
        return Err(QpairError::InvalidCapsule(format!(
            "range {offset}+{length} beyond command data length {total}"
        )));
    }
    Ok(())
}
