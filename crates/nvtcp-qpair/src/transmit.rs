//! Transmit loop: turns queued capsules into PDUs and owns the write half.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use bytes::Bytes;
use nvtcp_pdu::{DataPdu, Pdu, PduSink, SubmissionEntry};
use tracing::{debug, error, trace, warn};

use crate::buffer::{CommandBuffer, Storage};
use crate::capsule::{Capsule, Entry, Payload};
use crate::config::Role;
use crate::error::{QpairError, TransferError};
use crate::qpair::{transfer_length, Shared};
use crate::registry::Side;

/// Work for the transmit loop, in send order.
pub(crate) enum TxItem {
    /// Application capsule; turned into PDUs here.
    Capsule(Capsule),
    /// Ready-made PDU (R2T, data) from the other loop or the application.
    Pdu(Pdu),
    /// Termination request; sent even while terminating.
    Terminate(Pdu),
    /// Stop after everything queued before it.
    Shutdown,
}

pub(crate) struct Transmitter {
    shared: Arc<Shared>,
    sink: Box<dyn PduSink>,
    queue: Receiver<TxItem>,
}

impl Transmitter {
    pub(crate) fn new(shared: Arc<Shared>, sink: Box<dyn PduSink>, queue: Receiver<TxItem>) -> Self {
        Self {
            shared,
            sink,
            queue,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(qpair = %self.shared.name(), "transmit loop started");
        while let Ok(item) = self.queue.recv() {
            match item {
                TxItem::Shutdown => break,
                TxItem::Terminate(pdu) => {
                    if let Err(err) = self.sink.send_pdu(&pdu) {
                        warn!(qpair = %self.shared.name(), error = %err, "failed to send termination request");
                    }
                }
                TxItem::Pdu(pdu) => {
                    if self.shared.accepting() {
                        let sent = self.send(&pdu);
                        if let (true, Pdu::C2HData(DataPdu { success: true, cccid, .. })) = (sent, &pdu) {
                            // SUCCESS stands in for the response capsule.
                            self.shared.command_answered(*cccid);
                        }
                    } else {
                        trace!(qpair = %self.shared.name(), pdu_type = %pdu.pdu_type(), "dropping PDU after shutdown");
                    }
                }
                TxItem::Capsule(capsule) => {
                    if self.shared.accepting() {
                        self.transmit(capsule);
                    } else {
                        self.shared.abort_capsule(capsule);
                    }
                    self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                    self.shared.maybe_finish_drain();
                }
            }
        }

        self.shared.control.shutdown();
        while let Ok(item) = self.queue.try_recv() {
            if let TxItem::Capsule(capsule) = item {
                self.shared.abort_capsule(capsule);
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
        debug!(qpair = %self.shared.name(), "transmit loop stopped");
    }

    /// Write one PDU. A failed write closes the connection.
    fn send(&mut self, pdu: &Pdu) -> bool {
        match self.sink.send_pdu(pdu) {
            Ok(()) => true,
            Err(err) => {
                error!(qpair = %self.shared.name(), pdu_type = %pdu.pdu_type(), error = %err, "PDU write failed");
                self.shared.teardown(Some(QpairError::Pdu(err)));
                false
            }
        }
    }

    fn transmit(&mut self, capsule: Capsule) {
        match (self.shared.role(), *capsule.entry()) {
            (Role::Host, Entry::Command(sqe)) => self.transmit_command(sqe, capsule),
            (Role::Controller, Entry::Response(cqe)) => {
                debug!(qpair = %self.shared.name(), cid = cqe.cid(), status = cqe.status(), "sending response");
                if self.send(&Pdu::CapsuleResp { cqe }) {
                    self.shared.command_answered(cqe.cid());
                }
            }
            (role, _) => {
                warn!(qpair = %self.shared.name(), %role, cid = capsule.cid(), "capsule does not fit role; dropped");
            }
        }
    }

    fn transmit_command(&mut self, sqe: SubmissionEntry, capsule: Capsule) {
        let cid = sqe.cid();
        let threshold = self.shared.config.immediate_data_threshold as usize;
        let allow_immediate = capsule.allows_immediate_data();

        match capsule.into_payload() {
            Payload::None => self.send_untagged(sqe, Bytes::new()),
            Payload::Bytes(data) if allow_immediate && data.len() <= threshold => {
                let Ok(length) = transfer_length(data.len()) else {
                    return self.too_long(cid, Payload::Bytes(data));
                };
                let mut sqe = sqe;
                sqe.set_in_capsule_sgl(length);
                debug!(qpair = %self.shared.name(), cid, bytes = data.len(), "sending write with in-capsule data");
                self.send_untagged(sqe, data);
            }
            Payload::Bytes(data) => {
                let Ok(length) = transfer_length(data.len()) else {
                    return self.too_long(cid, Payload::Bytes(data));
                };
                let Some(tag) = self.shared.tags.allocate_plain() else {
                    return self.exhausted(cid, Payload::Bytes(data));
                };
                let mut sqe = sqe.with_cid(tag.wire());
                sqe.set_transport_sgl(length);
                let buffer = CommandBuffer::new(tag, cid, 0, length, Storage::Send(data));
                self.register_and_send(
                    Side::Transmit,
                    buffer,
                    Pdu::CapsuleCmd {
                        sqe,
                        data: Bytes::new(),
                    },
                );
            }
            Payload::Buffer(dest) => {
                let Ok(length) = transfer_length(dest.len()) else {
                    return self.too_long(cid, Payload::Buffer(dest));
                };
                let tags = &self.shared.tags;
                let tag = tags.allocate_accelerated(&dest.memory()).or_else(|| {
                    debug!(qpair = %self.shared.name(), cid, "read using plain tag");
                    tags.allocate_plain()
                });
                let Some(tag) = tag else {
                    return self.exhausted(cid, Payload::Buffer(dest));
                };
                let mut sqe = sqe.with_cid(tag.wire());
                sqe.set_transport_sgl(length);
                let buffer = CommandBuffer::new(tag, cid, 0, length, Storage::Receive(dest));
                self.register_and_send(
                    Side::Receive,
                    buffer,
                    Pdu::CapsuleCmd {
                        sqe,
                        data: Bytes::new(),
                    },
                );
            }
        }
    }

    /// Send a command with no transfer tag, under its own CID when that value
    /// is free on the wire and under a plain tag otherwise.
    fn send_untagged(&mut self, sqe: SubmissionEntry, data: Bytes) {
        let cid = sqe.cid();
        if self.shared.tags.claim_passthrough(cid) {
            trace!(qpair = %self.shared.name(), cid, "sending command under its own identifier");
            self.send(&Pdu::CapsuleCmd { sqe, data });
            return;
        }

        let payload = if data.is_empty() {
            Payload::None
        } else {
            Payload::Bytes(data.clone())
        };
        let Some(tag) = self.shared.tags.allocate_plain() else {
            return self.exhausted(cid, payload);
        };
        debug!(qpair = %self.shared.name(), cid, ?tag, "identifier busy on the wire; using plain tag");
        let storage = match payload {
            Payload::Bytes(bytes) => Storage::Send(bytes),
            _ => Storage::None,
        };
        // Nothing moves after the capsule, so the buffer is complete already.
        let mut buffer = CommandBuffer::new(tag, cid, 0, 0, storage);
        buffer.mark_complete();
        self.register_and_send(
            Side::Transmit,
            buffer,
            Pdu::CapsuleCmd {
                sqe: sqe.with_cid(tag.wire()),
                data,
            },
        );
    }

    fn register_and_send(&mut self, side: Side, buffer: CommandBuffer, pdu: Pdu) {
        let tag = buffer.tag;
        let cid = buffer.original_cid;
        if let Err(buffer) = self.shared.registries.side(side).insert(tag.wire(), buffer) {
            self.shared.abort_buffer(buffer);
            return;
        }
        debug!(qpair = %self.shared.name(), cid, ?tag, ?side, "command transmitted");
        self.send(&pdu);
    }

    fn too_long(&self, cid: u16, payload: Payload) {
        warn!(qpair = %self.shared.name(), cid, "payload too long for one command");
        self.shared
            .surface(Capsule::failed(cid, payload, TransferError::TooLong));
    }

    fn exhausted(&self, cid: u16, payload: Payload) {
        let error = if self.shared.accepting() {
            warn!(qpair = %self.shared.name(), cid, "transfer tags exhausted");
            TransferError::TagsExhausted
        } else {
            TransferError::ConnectionAborted
        };
        self.shared.surface(Capsule::failed(cid, payload, error));
    }
}
