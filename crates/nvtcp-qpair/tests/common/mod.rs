#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nvtcp_pdu::nvme::{opcode, status};
use nvtcp_pdu::{
    validate, CompletionEntry, Pdu, PduConfig, PduReader, PduSink, PduType, PduWriter,
    DEFAULT_MAX_PDU_SIZE,
};
use nvtcp_qpair::{
    Capsule, DataBuffer, DispatchState, Payload, QpairError, QpairEvent, QueuePair,
    QueuePairConfig,
};
use nvtcp_wire::{PlacementService, WireControl, WireStream};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(10);

/// Host settings where any buffer of at least `ddp_threshold` bytes is
/// eligible for placement regardless of its address.
pub fn host_config(name: &str) -> QueuePairConfig {
    let mut config = QueuePairConfig::host(name);
    config.page_size = 1;
    config.max_placement_pages = usize::MAX;
    config
}

pub fn controller_config(name: &str) -> QueuePairConfig {
    let mut config = QueuePairConfig::controller(name);
    config.page_size = 1;
    config.max_placement_pages = usize::MAX;
    config
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub struct Events(pub Receiver<QpairEvent>);

impl Events {
    pub fn next(&self) -> QpairEvent {
        self.0.recv_timeout(WAIT).expect("no queue pair event")
    }

    pub fn completion(&self) -> Arc<Capsule> {
        match self.next() {
            QpairEvent::Capsule(capsule) => capsule,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    pub fn connection_error(&self) -> QpairError {
        loop {
            if let QpairEvent::ConnectionError(err) = self.next() {
                return err;
            }
        }
    }
}

pub fn spawn_host(
    config: QueuePairConfig,
    stream: WireStream,
    placement: Arc<dyn PlacementService>,
) -> (QueuePair, Events) {
    let (tx, rx) = mpsc::channel();
    let qpair = QueuePair::spawn(config, stream, placement, Arc::new(tx)).expect("host spawn");
    (qpair, Events(rx))
}

/// One PDU the host wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub pdu_type: PduType,
    pub length: u32,
    pub last: bool,
}

struct TapSink {
    inner: PduWriter<WireStream>,
    log: Arc<Mutex<Vec<Sent>>>,
}

impl PduSink for TapSink {
    fn send_pdu(&mut self, pdu: &Pdu) -> nvtcp_pdu::Result<()> {
        let (length, last) = match pdu {
            Pdu::H2CData(data) | Pdu::C2HData(data) => (data.length, data.last),
            _ => (0, false),
        };
        self.log.lock().push(Sent {
            pdu_type: pdu.pdu_type(),
            length,
            last,
        });
        self.inner.send_pdu(pdu)
    }
}

/// Host whose outbound PDUs are logged before they hit the wire.
pub fn spawn_tapped_host(
    config: QueuePairConfig,
    stream: WireStream,
    placement: Arc<dyn PlacementService>,
) -> (QueuePair, Events, Arc<Mutex<Vec<Sent>>>) {
    let (tx, rx) = mpsc::channel();
    let log = Arc::new(Mutex::new(Vec::new()));
    let reader = PduReader::with_config_wire(
        stream.try_clone().expect("clone"),
        config.max_pdu_size,
        None,
    )
    .expect("reader");
    let control: Arc<dyn WireControl> = Arc::new(stream.try_clone().expect("clone"));
    let sink = TapSink {
        inner: PduWriter::with_config_wire(stream, config.pdu_config(), None).expect("writer"),
        log: Arc::clone(&log),
    };
    let qpair = QueuePair::spawn_with(
        config,
        Box::new(reader),
        Box::new(sink),
        control,
        placement,
        Arc::new(tx),
    )
    .expect("host spawn");
    (qpair, Events(rx), log)
}

pub fn wait_for_state(qpair: &QueuePair, wanted: &[DispatchState]) -> DispatchState {
    let start = Instant::now();
    loop {
        let state = qpair.state();
        if wanted.contains(&state) {
            return state;
        }
        assert!(start.elapsed() < WAIT, "stuck in {state}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// What a [`Target`] saw.
#[derive(Debug, Default)]
pub struct TargetLog {
    /// (cid, opcode, in-capsule bytes) per command.
    pub commands: Vec<(u16, u8, usize)>,
    /// Data written by the host, per command identifier.
    pub writes: HashMap<u16, Vec<u8>>,
    pub r2t_buffers: usize,
}

struct PendingWrite {
    data: Vec<u8>,
    remaining: usize,
    failed: bool,
    windows: Vec<(DataBuffer, usize)>,
}

/// A minimal controller: accepts writes (in-capsule or via R2T in
/// `r2t_chunk` windows), serves reads from [`pattern`] and answers
/// everything else with success.
pub struct Target {
    pub qpair: Arc<QueuePair>,
    worker: Option<JoinHandle<TargetLog>>,
}

impl Target {
    pub fn spawn(
        config: QueuePairConfig,
        stream: WireStream,
        placement: Arc<dyn PlacementService>,
        r2t_chunk: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let c2h_success = config.c2h_success;
        let qpair = Arc::new(
            QueuePair::spawn(config, stream, placement, Arc::new(tx)).expect("controller spawn"),
        );
        let worker = {
            let qpair = Arc::clone(&qpair);
            thread::spawn(move || serve(&qpair, rx, r2t_chunk, c2h_success))
        };
        Self {
            qpair,
            worker: Some(worker),
        }
    }

    /// Wait for the controller to close and return what it saw.
    pub fn finish(mut self) -> TargetLog {
        self.worker
            .take()
            .map(|worker| worker.join().expect("target panicked"))
            .unwrap_or_default()
    }
}

fn respond(qpair: &QueuePair, cid: u16, status: u16) {
    let _ = qpair.submit_capsule(Capsule::response(CompletionEntry::new(cid, status)));
}

fn serve(
    qpair: &QueuePair,
    events: Receiver<QpairEvent>,
    r2t_chunk: usize,
    c2h_success: bool,
) -> TargetLog {
    let mut log = TargetLog::default();
    let mut pending: HashMap<u16, PendingWrite> = HashMap::new();
    loop {
        let event = match events.recv_timeout(Duration::from_millis(20)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if qpair.state() == DispatchState::Closed {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            QpairEvent::Capsule(command) => {
                let Some(sqe) = command.sqe() else { continue };
                let cid = sqe.cid();
                let inline = match command.payload() {
                    Payload::Bytes(bytes) => Some(bytes.clone()),
                    _ => None,
                };
                log.commands
                    .push((cid, sqe.opcode(), inline.as_ref().map_or(0, Bytes::len)));

                match sqe.opcode() {
                    opcode::WRITE => {
                        if let Some(bytes) = inline {
                            log.writes.insert(cid, bytes.to_vec());
                            respond(qpair, cid, status::SUCCESS);
                            continue;
                        }
                        let total = sqe.sgl_length() as usize;
                        let mut write = PendingWrite {
                            data: vec![0; total],
                            remaining: total,
                            failed: false,
                            windows: Vec::new(),
                        };
                        let mut offset = 0;
                        while offset < total {
                            let len = r2t_chunk.min(total - offset);
                            let buffer = DataBuffer::new(len);
                            write.windows.push((buffer.clone(), offset));
                            qpair
                                .receive_controller_data(&command, offset as u32, buffer)
                                .expect("request host data");
                            log.r2t_buffers += 1;
                            offset += len;
                        }
                        pending.insert(cid, write);
                    }
                    opcode::READ => {
                        let len = sqe.sgl_length() as usize;
                        let data = Bytes::from(pattern(len, cid as u8));
                        qpair
                            .send_controller_data(&command, 0, data)
                            .expect("send read data");
                        if !c2h_success {
                            respond(qpair, cid, status::SUCCESS);
                        }
                    }
                    _ => respond(qpair, cid, status::SUCCESS),
                }
            }
            QpairEvent::Data {
                capsule,
                buffer,
                result,
            } => {
                let cid = capsule.cid();
                let Some(write) = pending.get_mut(&cid) else { continue };
                let Some(&(_, offset)) = write.windows.iter().find(|(b, _)| b.ptr_eq(&buffer))
                else {
                    continue;
                };
                let bytes = buffer.to_vec();
                write.data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                write.remaining -= bytes.len();
                write.failed |= result.is_err();
                if write.remaining == 0 {
                    if let Some(write) = pending.remove(&cid) {
                        let status = if write.failed {
                            status::DATA_TRANSFER_ERROR
                        } else {
                            status::SUCCESS
                        };
                        log.writes.insert(cid, write.data);
                        respond(qpair, cid, status);
                    }
                }
            }
            QpairEvent::ConnectionError(_) => break,
        }
    }
    log
}

/// Hand-driven peer for exercising protocol violations.
pub struct RawPeer {
    reader: PduReader<WireStream>,
    writer: PduWriter<WireStream>,
    config: PduConfig,
}

impl RawPeer {
    pub fn new(stream: WireStream, config: PduConfig) -> Self {
        let reader = PduReader::with_config_wire(
            stream.try_clone().expect("clone"),
            DEFAULT_MAX_PDU_SIZE,
            Some(WAIT),
        )
        .expect("reader");
        let writer = PduWriter::new(stream, config.clone());
        Self {
            reader,
            writer,
            config,
        }
    }

    pub fn recv(&mut self) -> Pdu {
        let inbound = self.reader.read_pdu().expect("read PDU");
        validate(&inbound, &self.config).expect("valid PDU").pdu
    }

    /// Next PDU, or `None` once the other side has closed.
    pub fn try_recv(&mut self) -> Option<Pdu> {
        let inbound = self.reader.read_pdu().ok()?;
        validate(&inbound, &self.config).ok().map(|v| v.pdu)
    }

    pub fn send(&mut self, pdu: &Pdu) {
        self.writer.write_pdu(pdu).expect("write PDU");
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.writer.get_mut();
        stream.write_all(bytes).expect("write bytes");
        stream.flush().expect("flush");
    }

    pub fn config(&self) -> &PduConfig {
        &self.config
    }
}
