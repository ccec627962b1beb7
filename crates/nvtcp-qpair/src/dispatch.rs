//! Receive loop: validates inbound PDUs and routes them to command buffers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use nvtcp_pdu::types::field;
use nvtcp_pdu::{
    validate, CompletionEntry, DataPdu, FatalErrorStatus, HwClass, InboundPdu, Pdu, PduError,
    PduSource, R2t, SubmissionEntry, TermReq, ValidatedPdu,
};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{DataFault, Storage};
use crate::capsule::{Capsule, Payload};
use crate::config::Role;
use crate::error::{QpairError, TransferError};
use crate::qpair::Shared;

/// Byte offset of the CID inside a CapsuleResp PDU.
const RESPONSE_CID: u32 = 20;

/// Receive-side connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Normal operation.
    Idle,
    /// No new commands; closes once in-flight work finishes.
    Draining,
    /// A termination request went out; inbound PDUs are discarded until the
    /// peer closes or the grace period ends.
    Terminating,
    Closed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
        })
    }
}

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    source: Box<dyn PduSource>,
    /// Reported once the terminating connection finally closes.
    terminated: Option<QpairError>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, source: Box<dyn PduSource>) -> Self {
        Self {
            shared,
            source,
            terminated: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(qpair = %self.shared.name(), "receive loop started");
        loop {
            let inbound = match self.source.next_pdu() {
                Ok(inbound) => inbound,
                Err(err) => {
                    if self.read_failed(err) {
                        break;
                    }
                    continue;
                }
            };
            match self.shared.state() {
                DispatchState::Closed => break,
                DispatchState::Terminating => {
                    trace!(qpair = %self.shared.name(), "discarding PDU while terminating");
                    continue;
                }
                DispatchState::Idle | DispatchState::Draining => {}
            }

            self.handle(inbound);
            self.shared.maybe_finish_drain();
        }
        debug!(qpair = %self.shared.name(), "receive loop stopped");
    }

    /// Returns whether the loop should stop.
    fn read_failed(&mut self, err: PduError) -> bool {
        match self.shared.state() {
            DispatchState::Closed => true,
            DispatchState::Terminating => {
                debug!(qpair = %self.shared.name(), error = %err, "terminating connection closed");
                let reason = self.terminated.take().unwrap_or(QpairError::ConnectionClosed);
                self.shared.teardown(Some(reason));
                true
            }
            DispatchState::Idle | DispatchState::Draining => {
                if let Some((fes, fei)) = err.termination() {
                    // Framing is lost; report and close without a grace period.
                    error!(qpair = %self.shared.name(), error = %err, "unreadable PDU stream");
                    self.shared
                        .enqueue_termination(self.termination_pdu(fes, fei, &[]));
                    self.shared.enter_terminating();
                    self.shared.teardown(Some(QpairError::Pdu(err)));
                    return true;
                }
                let reason = match err {
                    PduError::ConnectionClosed => {
                        info!(qpair = %self.shared.name(), "peer closed connection");
                        QpairError::ConnectionClosed
                    }
                    other => {
                        warn!(qpair = %self.shared.name(), error = %other, "receive failed");
                        QpairError::Pdu(other)
                    }
                };
                self.shared.teardown(Some(reason));
                true
            }
        }
    }

    fn handle(&mut self, inbound: InboundPdu) {
        let validated = match validate(&inbound, &self.shared.pdu_config) {
            Ok(validated) => validated,
            Err(err) => return self.reject(err, &inbound.bytes),
        };
        if let Err(err) = self.dispatch(validated) {
            self.fail(err, &inbound.bytes);
        }
    }

    /// Handle a PDU that failed validation.
    fn reject(&mut self, err: PduError, offending: &Bytes) {
        if let PduError::Hardware { code, class } = &err {
            match class {
                HwClass::Reset => {
                    error!(qpair = %self.shared.name(), code, "NIC reset connection state");
                    self.shared
                        .teardown(Some(QpairError::HardwareReset { code: *code }));
                    return;
                }
                HwClass::Unknown => {
                    error!(qpair = %self.shared.name(), code, "unknown hardware status; closing");
                    self.shared
                        .teardown(Some(QpairError::UnknownHardwareStatus { code: *code }));
                    return;
                }
                _ => {}
            }
        }

        let Some((fes, fei)) = err.termination() else {
            self.shared.teardown(Some(QpairError::Pdu(err)));
            return;
        };
        if self.shared.role() == Role::Host || err.is_sequence_violation() {
            error!(qpair = %self.shared.name(), error = %err, ?fes, fei, "malformed PDU");
            self.terminate(fes, fei, offending, QpairError::Pdu(err));
        } else {
            warn!(qpair = %self.shared.name(), error = %err, ?fes, fei, "dropping malformed PDU");
            self.shared
                .enqueue_termination(self.termination_pdu(fes, fei, offending));
        }
    }

    /// Handle a PDU that was well-formed but could not be applied.
    fn fail(&mut self, err: QpairError, offending: &Bytes) {
        match err {
            QpairError::Pdu(err) => self.reject(err, offending),
            QpairError::Sequence { fes, fei, .. } => {
                error!(qpair = %self.shared.name(), error = %err, "sequence violation");
                self.terminate(fes, fei, offending, err);
            }
            other => {
                self.shared.teardown(Some(other));
            }
        }
    }

    /// Send a termination request and wait out the grace period.
    fn terminate(&mut self, fes: FatalErrorStatus, fei: u32, offending: &[u8], reason: QpairError) {
        self.shared
            .enqueue_termination(self.termination_pdu(fes, fei, offending));
        if !self.shared.enter_terminating() {
            return;
        }
        self.terminated = Some(reason);
        let grace = self.shared.config.termination_grace();
        if let Err(err) = self.source.set_deadline(Some(grace)) {
            warn!(qpair = %self.shared.name(), error = %err, "cannot arm termination deadline");
            let reason = self.terminated.take().unwrap_or(QpairError::ConnectionClosed);
            self.shared.teardown(Some(reason));
        }
    }

    fn termination_pdu(&self, fes: FatalErrorStatus, fei: u32, offending: &[u8]) -> Pdu {
        let term = TermReq::new(fes, fei, offending);
        match self.shared.role() {
            Role::Host => Pdu::H2CTermReq(term),
            Role::Controller => Pdu::C2HTermReq(term),
        }
    }

    fn dispatch(&mut self, validated: ValidatedPdu) -> Result<(), QpairError> {
        let ValidatedPdu {
            pdu,
            data_digest_error,
            placed,
            ..
        } = validated;
        trace!(qpair = %self.shared.name(), pdu_type = %pdu.pdu_type(), "received PDU");

        match (self.shared.role(), pdu) {
            (_, Pdu::H2CTermReq(term)) | (_, Pdu::C2HTermReq(term)) => {
                warn!(qpair = %self.shared.name(), fes = ?term.fes, fei = term.fei, "peer terminated connection");
                Err(QpairError::PeerTerminated {
                    fes: term.fes,
                    fei: term.fei,
                })
            }
            (Role::Controller, Pdu::CapsuleCmd { sqe, data }) => self.on_command(sqe, data),
            (Role::Controller, Pdu::H2CData(pdu)) => {
                self.on_host_data(pdu, placed, data_digest_error)
            }
            (Role::Host, Pdu::CapsuleResp { cqe }) => self.on_response(cqe),
            (Role::Host, Pdu::C2HData(pdu)) => {
                self.on_controller_data(pdu, placed, data_digest_error)
            }
            (Role::Host, Pdu::R2T(r2t)) => self.on_r2t(r2t),
            (role, pdu) => {
                warn!(qpair = %self.shared.name(), %role, pdu_type = %pdu.pdu_type(), "PDU not valid for role");
                Err(QpairError::Pdu(PduError::InvalidField {
                    name: "pdu-type",
                    offset: field::PDU_TYPE,
                }))
            }
        }
    }

    fn on_command(&mut self, sqe: SubmissionEntry, data: Bytes) -> Result<(), QpairError> {
        let limit = self.shared.config.immediate_data_threshold as usize;
        if data.len() > limit {
            return Err(QpairError::Pdu(PduError::PduTooLarge {
                size: data.len(),
                max: limit,
            }));
        }
        debug!(qpair = %self.shared.name(), cid = sqe.cid(), opcode = sqe.opcode(), bytes = data.len(), "command received");
        let capsule = Capsule::command(sqe);
        let capsule = if data.is_empty() {
            capsule
        } else {
            capsule.with_data(data)
        };
        self.shared.command_surfaced(capsule.cid());
        self.shared.surface(capsule);
        Ok(())
    }

    fn on_response(&mut self, cqe: CompletionEntry) -> Result<(), QpairError> {
        let wire = cqe.cid();
        let Some((side, buffer)) = self.shared.registries.take(wire) else {
            if self.shared.tags.release_passthrough(wire) {
                debug!(qpair = %self.shared.name(), cid = wire, status = cqe.status(), "command completed");
                self.shared.surface(Capsule::completion(cqe, Payload::None, None));
                return Ok(());
            }
            return Err(QpairError::sequence(
                FatalErrorStatus::PduSequenceError,
                RESPONSE_CID,
                format!("response for unknown command {wire:#06x}"),
            ));
        };

        if cqe.is_success() && !buffer.is_complete() {
            let detail = format!(
                "success response for {wire:#06x} after {} of {} bytes",
                buffer.transferred(),
                buffer.length
            );
            self.shared.abort_buffer(buffer);
            return Err(QpairError::sequence(
                FatalErrorStatus::PduSequenceError,
                RESPONSE_CID,
                detail,
            ));
        }

        self.shared.tags.free(buffer.tag);
        let mut cqe = cqe;
        cqe.set_cid(buffer.original_cid);
        if let Some(err) = buffer.error {
            cqe.set_status(err.nvme_status());
        }
        debug!(qpair = %self.shared.name(), cid = buffer.original_cid, tag = ?buffer.tag, ?side, status = cqe.status(), "command completed");
        self.shared.surface(Capsule::completion(
            cqe,
            buffer.storage.into(),
            buffer.error,
        ));
        Ok(())
    }

    fn on_controller_data(
        &mut self,
        pdu: DataPdu,
        placed: bool,
        digest_error: bool,
    ) -> Result<(), QpairError> {
        let key = pdu.cccid;
        let complete = self
            .shared
            .registries
            .rx
            .with(key, |buffer| {
                if digest_error {
                    buffer.error.get_or_insert(TransferError::DataDigest);
                }
                buffer.accept_data(pdu.offset, pdu.length, pdu.last, placed, &pdu.data)
            })
            .ok_or_else(|| {
                QpairError::sequence(
                    FatalErrorStatus::PduSequenceError,
                    field::CCCID,
                    format!("data for unknown command {key:#06x}"),
                )
            })?
            .map_err(fault)?;
        if digest_error {
            warn!(qpair = %self.shared.name(), cid = key, offset = pdu.offset, "data digest mismatch");
        }

        if complete && pdu.success {
            let Some(buffer) = self.shared.registries.rx.remove(key) else {
                return Ok(());
            };
            self.shared.tags.free(buffer.tag);
            let status = buffer
                .error
                .map_or(nvtcp_pdu::nvme::status::SUCCESS, TransferError::nvme_status);
            debug!(qpair = %self.shared.name(), cid = buffer.original_cid, status, "read completed by data PDU");
            self.shared.surface(Capsule::completion(
                CompletionEntry::new(buffer.original_cid, status),
                buffer.storage.into(),
                buffer.error,
            ));
        }
        Ok(())
    }

    fn on_host_data(
        &mut self,
        pdu: DataPdu,
        placed: bool,
        digest_error: bool,
    ) -> Result<(), QpairError> {
        let key = pdu.ttag;
        let complete = self
            .shared
            .registries
            .rx
            .with(key, |buffer| {
                let cid = buffer.capsule.as_ref().map(|capsule| capsule.cid());
                if cid != Some(pdu.cccid) {
                    return Err(QpairError::sequence(
                        FatalErrorStatus::PduSequenceError,
                        field::CCCID,
                        format!("data for {:#06x} under tag {key:#06x}", pdu.cccid),
                    ));
                }
                if digest_error {
                    buffer.error.get_or_insert(TransferError::DataDigest);
                }
                buffer
                    .accept_data(pdu.offset, pdu.length, pdu.last, placed, &pdu.data)
                    .map_err(fault)
            })
            .ok_or_else(|| {
                QpairError::sequence(
                    FatalErrorStatus::PduSequenceError,
                    field::TTAG,
                    format!("data for unknown transfer tag {key:#06x}"),
                )
            })??;
        if digest_error {
            warn!(qpair = %self.shared.name(), ttag = key, offset = pdu.offset, "data digest mismatch");
        }
        if !complete {
            return Ok(());
        }

        let Some(buffer) = self.shared.registries.rx.remove(key) else {
            return Ok(());
        };
        self.shared.tags.free(buffer.tag);
        self.shared.r2t_done();
        let result = buffer.error.map_or(Ok(()), Err);
        if let (Some(capsule), Storage::Receive(data)) = (buffer.capsule, buffer.storage) {
            debug!(qpair = %self.shared.name(), cid = capsule.cid(), ttag = key, "host data received");
            self.shared.data_received(capsule, data, result);
        }
        Ok(())
    }

    fn on_r2t(&mut self, r2t: R2t) -> Result<(), QpairError> {
        let key = r2t.cccid;
        let max = self.shared.config.max_h2c_data;
        let segments = self
            .shared
            .registries
            .tx
            .with(key, |buffer| {
                let Storage::Send(bytes) = &buffer.storage else {
                    return Err(DataFault::OutOfRange {
                        offset: r2t.offset,
                        length: r2t.length,
                    });
                };
                let bytes = bytes.clone();
                buffer.accept_grant(r2t.offset, r2t.length)?;
                buffer.ttag = r2t.ttag;

                let end = r2t.offset + r2t.length;
                let mut pdus = Vec::new();
                let mut at = r2t.offset;
                while at < end {
                    let chunk = max.min(end - at);
                    pdus.push(Pdu::H2CData(DataPdu {
                        cccid: key,
                        ttag: r2t.ttag,
                        offset: at,
                        length: chunk,
                        last: at + chunk == end,
                        success: false,
                        data: bytes.slice(at as usize..(at + chunk) as usize),
                    }));
                    at += chunk;
                }
                Ok(pdus)
            })
            .ok_or_else(|| {
                QpairError::sequence(
                    FatalErrorStatus::PduSequenceError,
                    field::CCCID,
                    format!("R2T for unknown command {key:#06x}"),
                )
            })?
            .map_err(fault)?;

        debug!(qpair = %self.shared.name(), cid = key, ttag = r2t.ttag, offset = r2t.offset, length = r2t.length, pdus = segments.len(), "R2T granted");
        for pdu in segments {
            self.shared.enqueue(pdu);
        }
        Ok(())
    }
}

fn fault(fault: DataFault) -> QpairError {
    let (fes, fei) = fault.termination();
    QpairError::sequence(fes, fei, fault.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    use bytes::BytesMut;
    use nvtcp_pdu::nvme::{opcode, status};
    use nvtcp_pdu::{encode_pdu, PduConfig, PduSink, RxStatus};
    use nvtcp_wire::{PlacementService, SoftwarePlacement, WireControl};

    use super::*;
    use crate::buffer::DataBuffer;
    use crate::config::QueuePairConfig;
    use crate::qpair::{QpairEvent, QueuePair};

    const WAIT: Duration = Duration::from_secs(5);

    struct ScriptedSource {
        inbound: Receiver<InboundPdu>,
        hangup: Arc<AtomicBool>,
        deadline: Option<Duration>,
    }

    impl PduSource for ScriptedSource {
        fn next_pdu(&mut self) -> nvtcp_pdu::Result<InboundPdu> {
            let mut waited = Duration::ZERO;
            let tick = Duration::from_millis(5);
            loop {
                if self.hangup.load(Ordering::Acquire) {
                    return Err(PduError::ConnectionClosed);
                }
                match self.inbound.recv_timeout(tick) {
                    Ok(pdu) => return Ok(pdu),
                    Err(RecvTimeoutError::Disconnected) => return Err(PduError::ConnectionClosed),
                    Err(RecvTimeoutError::Timeout) => {}
                }
                waited += tick;
                if self.deadline.is_some_and(|deadline| waited >= deadline) {
                    return Err(PduError::Io(std::io::ErrorKind::TimedOut.into()));
                }
            }
        }

        fn set_deadline(&mut self, timeout: Option<Duration>) -> nvtcp_pdu::Result<()> {
            self.deadline = timeout;
            Ok(())
        }
    }

    struct RecordingSink(Sender<Pdu>);

    impl PduSink for RecordingSink {
        fn send_pdu(&mut self, pdu: &Pdu) -> nvtcp_pdu::Result<()> {
            let _ = self.0.send(pdu.clone());
            Ok(())
        }
    }

    struct Hangup(Arc<AtomicBool>);

    impl WireControl for Hangup {
        fn shutdown(&self) {
            self.0.store(true, Ordering::Release);
        }
    }

    struct Harness {
        qpair: QueuePair,
        pdu_config: PduConfig,
        inbound: Sender<InboundPdu>,
        outbound: Receiver<Pdu>,
        events: Receiver<QpairEvent>,
        placement: Arc<SoftwarePlacement>,
        hangup: Arc<AtomicBool>,
    }

    impl Harness {
        fn new(mut config: QueuePairConfig) -> Self {
            // Any address is "page aligned" at page size 1.
            config.page_size = 1;
            config.max_placement_pages = usize::MAX;
            let (inbound, inbound_rx) = mpsc::channel();
            let (outbound_tx, outbound) = mpsc::channel();
            let (events_tx, events) = mpsc::channel();
            let hangup = Arc::new(AtomicBool::new(false));
            let placement = Arc::new(SoftwarePlacement::new(64));
            let pdu_config = config.pdu_config();
            let qpair = QueuePair::spawn_with(
                config,
                Box::new(ScriptedSource {
                    inbound: inbound_rx,
                    hangup: Arc::clone(&hangup),
                    deadline: None,
                }),
                Box::new(RecordingSink(outbound_tx)),
                Arc::new(Hangup(Arc::clone(&hangup))),
                Arc::clone(&placement) as Arc<dyn PlacementService>,
                Arc::new(events_tx),
            )
            .unwrap();
            Self {
                qpair,
                pdu_config,
                inbound,
                outbound,
                events,
                placement,
                hangup,
            }
        }

        fn push_with(&self, pdu: &Pdu, status: RxStatus) {
            let mut buf = BytesMut::new();
            encode_pdu(pdu, &self.pdu_config, &mut buf).unwrap();
            self.inbound
                .send(InboundPdu::with_status(buf.freeze(), status))
                .unwrap();
        }

        fn push(&self, pdu: &Pdu) {
            self.push_with(pdu, RxStatus::OK);
        }

        fn sent(&self) -> Pdu {
            self.outbound.recv_timeout(WAIT).expect("no PDU sent")
        }

        fn event(&self) -> QpairEvent {
            self.events.recv_timeout(WAIT).expect("no event")
        }

        fn completion(&self) -> Arc<Capsule> {
            match self.event() {
                QpairEvent::Capsule(capsule) => capsule,
                other => panic!("expected capsule, got {other:?}"),
            }
        }

        fn connection_error(&self) -> QpairError {
            loop {
                if let QpairEvent::ConnectionError(err) = self.event() {
                    return err;
                }
            }
        }

        fn wait_state(&self, state: DispatchState) {
            let start = std::time::Instant::now();
            while self.qpair.state() != state {
                assert!(start.elapsed() < WAIT, "queue pair never reached {state}");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        fn wait_closed(&self) {
            self.wait_state(DispatchState::Closed);
        }
    }

    fn host() -> QueuePairConfig {
        QueuePairConfig::host("host")
    }

    fn controller() -> QueuePairConfig {
        QueuePairConfig::controller("ctrl")
    }

    fn data_pdu(cccid: u16, ttag: u16, offset: u32, data: &[u8], last: bool) -> DataPdu {
        DataPdu {
            cccid,
            ttag,
            offset,
            length: data.len() as u32,
            last,
            success: false,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn sent_command(harness: &Harness) -> (SubmissionEntry, Bytes) {
        match harness.sent() {
            Pdu::CapsuleCmd { sqe, data } => (sqe, data),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn small_write_goes_in_capsule() {
        let h = Harness::new(host());
        let capsule = Capsule::command(SubmissionEntry::new(opcode::WRITE, 3)).with_data(vec![7u8; 512]);
        h.qpair.submit_capsule(capsule).unwrap();

        let (sqe, data) = sent_command(&h);
        assert_eq!(sqe.cid(), 3);
        assert!(sqe.has_in_capsule_data());
        assert_eq!(data.len(), 512);

        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(3),
        });
        let done = h.completion();
        assert_eq!(done.cid(), 3);
        assert!(done.is_success());
        assert_eq!(h.qpair.live_tags(), 0);
    }

    #[test]
    fn large_write_follows_r2t() {
        let mut config = host();
        config.max_h2c_data = 4096;
        let h = Harness::new(config);
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let capsule = Capsule::command(SubmissionEntry::new(opcode::WRITE, 9)).with_data(payload.clone());
        h.qpair.submit_capsule(capsule).unwrap();

        let (sqe, data) = sent_command(&h);
        assert_eq!(sqe.cid(), 0x8000);
        assert_eq!(sqe.sgl_length(), 10_000);
        assert!(data.is_empty());

        h.push(&Pdu::R2T(R2t {
            cccid: 0x8000,
            ttag: 0x21,
            offset: 0,
            length: 10_000,
        }));
        let mut received = Vec::new();
        let mut lasts = Vec::new();
        for _ in 0..3 {
            match h.sent() {
                Pdu::H2CData(pdu) => {
                    assert_eq!(pdu.ttag, 0x21);
                    assert_eq!(pdu.offset as usize, received.len());
                    received.extend_from_slice(&pdu.data);
                    lasts.push(pdu.last);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
        assert_eq!(received, payload);
        assert_eq!(lasts, [false, false, true]);

        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(0x8000),
        });
        let done = h.completion();
        assert_eq!(done.cid(), 9);
        assert!(done.is_success());
        assert_eq!(h.qpair.outstanding(), 0);
    }

    #[test]
    fn read_completes_on_success_flag() {
        let h = Harness::new(host());
        let dest = DataBuffer::new(8192);
        let capsule = Capsule::command(SubmissionEntry::new(opcode::READ, 4)).with_buffer(dest.clone());
        h.qpair.submit_capsule(capsule).unwrap();

        let (sqe, _) = sent_command(&h);
        assert_eq!(sqe.cid(), 0x0000, "eligible read takes an accelerated tag");
        assert_eq!(h.placement.live_count(), 1);

        h.push(&Pdu::C2HData(data_pdu(0, 0, 0, &[1u8; 4096], false)));
        let mut tail = data_pdu(0, 0, 4096, &[2u8; 4096], true);
        tail.success = true;
        h.push(&Pdu::C2HData(tail));

        let done = h.completion();
        assert_eq!(done.cid(), 4);
        assert!(done.is_success());
        let contents = dest.to_vec();
        assert!(contents[..4096].iter().all(|b| *b == 1));
        assert!(contents[4096..].iter().all(|b| *b == 2));
        assert_eq!(h.placement.live_count(), 0);
    }

    #[test]
    fn placed_gap_counts_toward_completion() {
        let h = Harness::new(host());
        let dest = DataBuffer::new(8192);
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 1)).with_buffer(dest))
            .unwrap();
        let (sqe, _) = sent_command(&h);

        // First half never reaches software; second half arrives placed.
        let mut pdu = data_pdu(sqe.cid(), 0, 4096, &[0u8; 4096], true);
        pdu.success = true;
        h.push_with(&Pdu::C2HData(pdu), RxStatus::PLACED);

        let done = h.completion();
        assert!(done.is_success());
        assert_eq!(done.cid(), 1);
    }

    #[test]
    fn data_digest_error_fails_completion() {
        let mut config = host();
        config.data_digest = true;
        let h = Harness::new(config);
        h.qpair
            .submit_capsule(
                Capsule::command(SubmissionEntry::new(opcode::READ, 2)).with_buffer(DataBuffer::new(64)),
            )
            .unwrap();
        let (sqe, _) = sent_command(&h);

        let mut buf = BytesMut::new();
        let pdu = Pdu::C2HData(data_pdu(sqe.cid(), 0, 0, &[5u8; 64], true));
        encode_pdu(&pdu, &h.pdu_config, &mut buf).unwrap();
        let len = buf.len();
        buf[len - 1] ^= 0xff;
        h.inbound.send(InboundPdu::new(buf.freeze())).unwrap();

        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(sqe.cid()),
        });
        let done = h.completion();
        assert_eq!(done.cid(), 2);
        assert_eq!(done.cqe().map(|cqe| cqe.status()), Some(status::DATA_TRANSFER_ERROR));
        assert_eq!(done.transfer_error(), Some(TransferError::DataDigest));
        assert_eq!(h.qpair.state(), DispatchState::Idle);
    }

    #[test]
    fn out_of_order_data_terminates() {
        let mut config = host();
        config.accelerated_tags = 0;
        config.termination_grace_ms = 50;
        let h = Harness::new(config);
        h.qpair
            .submit_capsule(
                Capsule::command(SubmissionEntry::new(opcode::READ, 6)).with_buffer(DataBuffer::new(8192)),
            )
            .unwrap();
        let (sqe, _) = sent_command(&h);
        assert_eq!(sqe.cid(), 0x8000);

        h.push(&Pdu::C2HData(data_pdu(0x8000, 0, 4096, &[0u8; 4096], true)));
        match h.sent() {
            Pdu::H2CTermReq(term) => {
                assert_eq!(term.fes, FatalErrorStatus::PduSequenceError);
                assert_eq!(term.fei, field::DATAO);
            }
            other => panic!("expected termination request, got {other:?}"),
        }

        let aborted = h.completion();
        assert_eq!(aborted.cid(), 6);
        assert_eq!(aborted.transfer_error(), Some(TransferError::ConnectionAborted));
        assert!(matches!(h.connection_error(), QpairError::Sequence { .. }));
        h.wait_closed();
    }

    #[test]
    fn unknown_response_is_sequence_violation() {
        let mut config = host();
        config.termination_grace_ms = 20;
        let h = Harness::new(config);
        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(0x4242),
        });
        match h.sent() {
            Pdu::H2CTermReq(term) => assert_eq!(term.fei, RESPONSE_CID),
            other => panic!("expected termination request, got {other:?}"),
        }
        assert!(matches!(h.connection_error(), QpairError::Sequence { .. }));
    }

    #[test]
    fn peer_termination_closes() {
        let h = Harness::new(host());
        h.push(&Pdu::C2HTermReq(TermReq::new(
            FatalErrorStatus::InvalidHeaderField,
            field::HLEN,
            &[],
        )));
        assert!(matches!(
            h.connection_error(),
            QpairError::PeerTerminated { fes: FatalErrorStatus::InvalidHeaderField, .. }
        ));
        h.wait_closed();
        assert!(h.hangup.load(Ordering::Acquire));
        assert!(matches!(
            h.qpair.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::FLUSH, 1))),
            Err(QpairError::Closed)
        ));
    }

    #[test]
    fn hardware_reset_closes_without_termination() {
        let h = Harness::new(host());
        h.push_with(
            &Pdu::CapsuleResp {
                cqe: CompletionEntry::success(1),
            },
            RxStatus::with_code(nvtcp_pdu::status::code::LINK_RESET),
        );
        assert!(matches!(h.connection_error(), QpairError::HardwareReset { .. }));
        h.wait_closed();
        assert!(h.outbound.try_iter().all(|pdu| !matches!(pdu, Pdu::H2CTermReq(_))));
    }

    #[test]
    fn unknown_hardware_status_closes_without_termination() {
        let h = Harness::new(host());
        h.push_with(
            &Pdu::CapsuleResp {
                cqe: CompletionEntry::success(1),
            },
            RxStatus::with_code(0x7f),
        );
        assert!(matches!(
            h.connection_error(),
            QpairError::UnknownHardwareStatus { code: 0x7f }
        ));
        h.wait_closed();
        assert!(h.outbound.try_iter().all(|pdu| !matches!(pdu, Pdu::H2CTermReq(_))));
    }

    #[test]
    fn malformed_hardware_status_is_dropped_by_controller() {
        let h = Harness::new(controller());
        h.push_with(
            &Pdu::CapsuleCmd {
                sqe: SubmissionEntry::new(opcode::FLUSH, 1),
                data: Bytes::new(),
            },
            RxStatus::with_code(nvtcp_pdu::status::code::PDU_LENGTH),
        );
        match h.sent() {
            Pdu::C2HTermReq(term) => {
                assert_eq!(term.fes, FatalErrorStatus::InvalidHeaderField);
                assert_eq!(term.fei, field::PLEN);
            }
            other => panic!("expected termination request, got {other:?}"),
        }
        assert_eq!(h.qpair.state(), DispatchState::Idle);

        h.push(&Pdu::CapsuleCmd {
            sqe: SubmissionEntry::new(opcode::FLUSH, 2),
            data: Bytes::new(),
        });
        assert_eq!(h.completion().cid(), 2);
    }

    #[test]
    fn malformed_hardware_status_terminates_host() {
        let mut config = host();
        config.termination_grace_ms = 1000;
        let h = Harness::new(config);
        h.push_with(
            &Pdu::CapsuleResp {
                cqe: CompletionEntry::success(1),
            },
            RxStatus::with_code(nvtcp_pdu::status::code::HEADER_LENGTH),
        );
        match h.sent() {
            Pdu::H2CTermReq(term) => {
                assert_eq!(term.fes, FatalErrorStatus::InvalidHeaderField);
                assert_eq!(term.fei, field::HLEN);
            }
            other => panic!("expected termination request, got {other:?}"),
        }
        h.wait_state(DispatchState::Terminating);
        assert!(matches!(
            h.connection_error(),
            QpairError::Pdu(PduError::Hardware { .. })
        ));
        h.wait_closed();
    }

    #[test]
    fn hardware_sequence_status_terminates_controller() {
        let mut config = controller();
        config.termination_grace_ms = 20;
        let h = Harness::new(config);
        h.push_with(
            &Pdu::CapsuleCmd {
                sqe: SubmissionEntry::new(opcode::FLUSH, 1),
                data: Bytes::new(),
            },
            RxStatus::with_code(nvtcp_pdu::status::code::BAD_OFFSET),
        );
        match h.sent() {
            Pdu::C2HTermReq(term) => assert_eq!(term.fes, FatalErrorStatus::PduSequenceError),
            other => panic!("expected termination request, got {other:?}"),
        }
        assert!(matches!(
            h.connection_error(),
            QpairError::Pdu(PduError::Hardware {
                class: HwClass::Sequence,
                ..
            })
        ));
        h.wait_closed();
    }

    #[test]
    fn placed_payload_on_plain_tag_terminates() {
        let mut config = host();
        config.accelerated_tags = 0;
        config.termination_grace_ms = 50;
        let h = Harness::new(config);
        let dest = DataBuffer::new(4096);
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 3)).with_buffer(dest.clone()))
            .unwrap();
        let (sqe, _) = sent_command(&h);
        assert_eq!(sqe.cid(), 0x8000);

        let mut pdu = data_pdu(0x8000, 0, 0, &[9u8; 4096], true);
        pdu.success = true;
        h.push_with(&Pdu::C2HData(pdu), RxStatus::PLACED);
        match h.sent() {
            Pdu::H2CTermReq(term) => {
                assert_eq!(term.fes, FatalErrorStatus::PduSequenceError);
                assert_eq!(term.fei, field::CCCID);
            }
            other => panic!("expected termination request, got {other:?}"),
        }

        let aborted = h.completion();
        assert_eq!(aborted.cid(), 3);
        assert_eq!(aborted.transfer_error(), Some(TransferError::ConnectionAborted));
        assert!(dest.to_vec().iter().all(|b| *b == 0));
        assert!(matches!(h.connection_error(), QpairError::Sequence { .. }));
        h.wait_closed();
    }

    #[test]
    fn controller_answers_commands_while_draining() {
        let h = Harness::new(controller());
        h.push(&Pdu::CapsuleCmd {
            sqe: SubmissionEntry::new(opcode::FLUSH, 4),
            data: Bytes::new(),
        });
        assert_eq!(h.completion().cid(), 4);

        h.qpair.drain();
        assert_eq!(h.qpair.state(), DispatchState::Draining);
        h.qpair
            .submit_capsule(Capsule::response(CompletionEntry::success(4)))
            .unwrap();
        match h.sent() {
            Pdu::CapsuleResp { cqe } => assert_eq!(cqe.cid(), 4),
            other => panic!("expected response, got {other:?}"),
        }
        h.wait_closed();
    }

    #[test]
    fn controller_drain_waits_for_success_flag_data() {
        let mut config = controller();
        config.c2h_success = true;
        let h = Harness::new(config);
        let mut sqe = SubmissionEntry::new(opcode::READ, 5);
        sqe.set_transport_sgl(8);
        h.push(&Pdu::CapsuleCmd {
            sqe,
            data: Bytes::new(),
        });
        let command = h.completion();

        h.qpair.drain();
        assert_eq!(h.qpair.state(), DispatchState::Draining);
        h.qpair
            .send_controller_data(&command, 0, Bytes::from_static(b"abcdefgh"))
            .unwrap();
        match h.sent() {
            Pdu::C2HData(pdu) => assert!(pdu.last && pdu.success),
            other => panic!("expected data, got {other:?}"),
        }
        h.wait_closed();
    }

    #[test]
    fn controller_surfaces_commands_and_requests_data() {
        let mut config = controller();
        config.max_outstanding_r2t = 1;
        let h = Harness::new(config);

        let mut sqe = SubmissionEntry::new(opcode::WRITE, 11);
        sqe.set_transport_sgl(8192);
        h.push(&Pdu::CapsuleCmd {
            sqe,
            data: Bytes::new(),
        });
        let command = h.completion();
        assert_eq!(command.cid(), 11);

        let first = DataBuffer::new(4096);
        let second = DataBuffer::new(4096);
        h.qpair
            .receive_controller_data(&command, 0, first.clone())
            .unwrap();
        h.qpair
            .receive_controller_data(&command, 4096, second.clone())
            .unwrap();

        let r2t = match h.sent() {
            Pdu::R2T(r2t) => r2t,
            other => panic!("expected R2T, got {other:?}"),
        };
        assert_eq!((r2t.cccid, r2t.offset, r2t.length), (11, 0, 4096));
        assert!(h.outbound.recv_timeout(Duration::from_millis(50)).is_err(), "second R2T held back");

        h.push(&Pdu::H2CData(data_pdu(11, r2t.ttag, 0, &[3u8; 4096], true)));
        match h.event() {
            QpairEvent::Data { buffer, result, .. } => {
                assert!(result.is_ok());
                assert!(buffer.ptr_eq(&first));
            }
            other => panic!("expected data, got {other:?}"),
        }
        let next = match h.sent() {
            Pdu::R2T(r2t) => r2t,
            other => panic!("expected R2T, got {other:?}"),
        };
        assert_eq!(next.offset, 4096);
        assert!(first.to_vec().iter().all(|b| *b == 3));
    }

    #[test]
    fn controller_tolerates_malformed_pdu() {
        let h = Harness::new(controller());
        let mut buf = BytesMut::new();
        encode_pdu(
            &Pdu::CapsuleCmd {
                sqe: SubmissionEntry::new(opcode::FLUSH, 1),
                data: Bytes::new(),
            },
            &h.pdu_config,
            &mut buf,
        )
        .unwrap();
        buf[2] = 0x10; // hlen
        h.inbound.send(InboundPdu::new(buf.freeze())).unwrap();

        match h.sent() {
            Pdu::C2HTermReq(term) => assert_eq!(term.fei, field::HLEN),
            other => panic!("expected termination request, got {other:?}"),
        }
        assert_eq!(h.qpair.state(), DispatchState::Idle);

        h.push(&Pdu::CapsuleCmd {
            sqe: SubmissionEntry::new(opcode::FLUSH, 2),
            data: Bytes::new(),
        });
        assert_eq!(h.completion().cid(), 2);
    }

    #[test]
    fn controller_sends_segmented_read_data() {
        let mut config = controller();
        config.max_c2h_data = 1000;
        config.c2h_success = true;
        let h = Harness::new(config);
        let mut sqe = SubmissionEntry::new(opcode::READ, 5);
        sqe.set_transport_sgl(2500);
        let command = Capsule::command(sqe);

        h.qpair
            .send_controller_data(&command, 0, Bytes::from(vec![1u8; 2500]))
            .unwrap();
        let mut flags = Vec::new();
        for _ in 0..3 {
            match h.sent() {
                Pdu::C2HData(pdu) => flags.push((pdu.length, pdu.last, pdu.success)),
                other => panic!("expected data, got {other:?}"),
            }
        }
        assert_eq!(
            flags,
            [(1000, false, false), (1000, false, false), (500, true, true)]
        );
    }

    #[test]
    fn drain_closes_when_idle() {
        let h = Harness::new(host());
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::FLUSH, 8)))
            .unwrap();
        let _ = sent_command(&h);

        h.qpair.drain();
        assert_eq!(h.qpair.state(), DispatchState::Draining);
        assert!(matches!(
            h.qpair.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::FLUSH, 9))),
            Err(QpairError::Draining)
        ));

        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(8),
        });
        assert_eq!(h.completion().cid(), 8);
        h.wait_closed();
    }

    #[test]
    fn shutdown_aborts_outstanding_commands() {
        let h = Harness::new(host());
        let dest = DataBuffer::new(8192);
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 1)).with_buffer(dest))
            .unwrap();
        h.qpair
            .submit_capsule(
                Capsule::command(SubmissionEntry::new(opcode::WRITE, 2)).with_data(vec![0u8; 65536]),
            )
            .unwrap();
        let _ = sent_command(&h);
        let _ = sent_command(&h);
        assert_eq!(h.placement.live_count(), 1);

        h.qpair.shutdown();
        let mut cids = vec![h.completion().cid(), h.completion().cid()];
        cids.sort_unstable();
        assert_eq!(cids, [1, 2]);
        assert_eq!(h.placement.live_count(), 0);
        assert_eq!(h.qpair.live_tags(), 0);
    }

    #[test]
    fn colliding_identifier_uses_plain_tag() {
        let h = Harness::new(host());
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::FLUSH, 0x8000)))
            .unwrap();
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::WRITE, 7)).with_data(vec![1u8; 65536]))
            .unwrap();
        h.qpair
            .submit_capsule(Capsule::command(SubmissionEntry::new(opcode::FLUSH, 0x8001)))
            .unwrap();

        assert_eq!(sent_command(&h).0.cid(), 0x8000);
        // 0x8000 is claimed, so the write gets the next plain tag.
        assert_eq!(sent_command(&h).0.cid(), 0x8001);
        let (sqe, _) = sent_command(&h);
        assert_eq!(sqe.cid(), 0x8002);

        h.push(&Pdu::CapsuleResp {
            cqe: CompletionEntry::success(0x8002),
        });
        assert_eq!(h.completion().cid(), 0x8001);
    }

    #[test]
    fn exhausted_tags_complete_as_transient() {
        let mut config = host();
        config.plain_tags = 1;
        config.accelerated_tags = 0;
        let h = Harness::new(config);
        for cid in [1, 2] {
            h.qpair
                .submit_capsule(
                    Capsule::command(SubmissionEntry::new(opcode::WRITE, cid)).with_data(vec![0u8; 65536]),
                )
                .unwrap();
        }

        assert_eq!(sent_command(&h).0.cid(), 0x8000);
        let refused = h.completion();
        assert_eq!(refused.cid(), 2);
        assert_eq!(refused.transfer_error(), Some(TransferError::TagsExhausted));
        assert_eq!(
            refused.cqe().map(|cqe| cqe.status()),
            Some(status::TRANSIENT_TRANSPORT_ERROR)
        );
        assert_eq!(h.qpair.state(), DispatchState::Idle);
    }

    #[test]
    fn wrong_role_is_rejected() {
        let h = Harness::new(host());
        assert!(matches!(
            h.qpair.submit_capsule(Capsule::response(CompletionEntry::success(1))),
            Err(QpairError::WrongRole { .. })
        ));
        let command = Arc::new(Capsule::command(SubmissionEntry::new(opcode::WRITE, 1)));
        assert!(matches!(
            h.qpair.receive_controller_data(&command, 0, DataBuffer::new(1)),
            Err(QpairError::WrongRole { .. })
        ));
    }
}
