use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nvtcp_pdu::nvme::{opcode, status};
use nvtcp_pdu::{CompletionEntry, SubmissionEntry};
use nvtcp_qpair::{
    Capsule, DataBuffer, DispatchState, Payload, QpairEvent, QueuePair, QueuePairConfig,
};
use nvtcp_wire::{NoPlacement, PlacementService, SoftwarePlacement, WireStream};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{usage, LoopbackArgs};
use crate::exit::{
    io_error, qpair_error, wire_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, TIMEOUT,
};
use crate::output::{print_record, OutputFormat};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);
const PLACEMENT_CAPACITY: usize = 64;

#[derive(Debug, Default, Serialize)]
struct LoopbackReport {
    rounds: u64,
    writes: u64,
    reads: u64,
    failed: u64,
    corrupt_reads: u64,
    bytes_written: u64,
    bytes_read: u64,
    placement_mappings: usize,
    elapsed_ms: u64,
    mib_per_sec: f64,
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    if args.writes + args.reads == 0 {
        return Err(usage("nothing to do: --writes and --reads are both zero"));
    }
    let size = u32::try_from(args.size).map_err(|_| usage("--size exceeds 4 GiB"))?;
    if size == 0 {
        return Err(usage("--size must be greater than zero"));
    }

    let mut host_config = QueuePairConfig::host("host");
    let mut ctrl_config = QueuePairConfig::controller("ctrl");
    for config in [&mut host_config, &mut ctrl_config] {
        config.header_digest = args.digests;
        config.data_digest = args.digests;
    }
    if let Some(tags) = args.accelerated_tags {
        host_config.accelerated_tags = tags;
    }
    ctrl_config.c2h_success = args.c2h_success;

    let (host_end, ctrl_end) = connect_loopback()?;
    let controller = Controller::spawn(ctrl_config, ctrl_end)?;

    let placement = Arc::new(SoftwarePlacement::new(PLACEMENT_CAPACITY));
    let (events_tx, events) = mpsc::channel();
    let host = QueuePair::spawn(
        host_config,
        host_end,
        Arc::clone(&placement) as Arc<dyn PlacementService>,
        Arc::new(events_tx),
    )
    .map_err(|err| qpair_error("host start failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    if args.continuous {
        install_ctrlc_handler(Arc::clone(&running))?;
    }

    let mut report = LoopbackReport::default();
    let started = Instant::now();
    let outcome = loop {
        if let Err(err) = run_round(&host, &events, &args, size, &mut report) {
            break Err(err);
        }
        report.rounds += 1;
        if !args.continuous || !running.load(Ordering::SeqCst) {
            break Ok(());
        }
    };

    host.drain();
    wait_closed(&host);
    drop(host);
    controller.finish();

    let elapsed = started.elapsed();
    report.elapsed_ms = elapsed.as_millis() as u64;
    report.placement_mappings = placement.events().len();
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        report.mib_per_sec =
            (report.bytes_written + report.bytes_read) as f64 / (1024.0 * 1024.0) / secs;
    }
    print_record(&report, format);

    outcome?;
    if report.failed > 0 || report.corrupt_reads > 0 {
        Ok(FAILURE)
    } else {
        Ok(SUCCESS)
    }
}

fn connect_loopback() -> CliResult<(WireStream, WireStream)> {
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|err| io_error("bind failed", err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| io_error("bind failed", err))?;
    let host_end = WireStream::connect(addr).map_err(|err| wire_error("connect failed", err))?;
    let (accepted, _) = listener
        .accept()
        .map_err(|err| io_error("accept failed", err))?;
    debug!(%addr, "loopback connected");
    Ok((host_end, WireStream::from_tcp(accepted)))
}

fn run_round(
    host: &QueuePair,
    events: &Receiver<QpairEvent>,
    args: &LoopbackArgs,
    size: u32,
    report: &mut LoopbackReport,
) -> CliResult<()> {
    let mut reads: HashMap<u16, DataBuffer> = HashMap::new();
    let total = args.writes + args.reads;

    for index in 0..total {
        let cid = u16::try_from(index).map_err(|_| usage("at most 65536 commands per round"))?;
        let capsule = if index < args.writes {
            Capsule::command(SubmissionEntry::new(opcode::WRITE, cid))
                .with_data(pattern(size as usize, cid as u8))
        } else {
            let buffer = DataBuffer::new(size as usize);
            reads.insert(cid, buffer.clone());
            Capsule::command(SubmissionEntry::new(opcode::READ, cid)).with_buffer(buffer)
        };
        host.submit_capsule(capsule)
            .map_err(|err| qpair_error("submit failed", err))?;
    }

    let mut pending = total;
    while pending > 0 {
        let event = events.recv_timeout(COMPLETION_TIMEOUT).map_err(|_| {
            CliError::new(TIMEOUT, format!("{pending} commands still outstanding"))
        })?;
        let capsule = match event {
            QpairEvent::Capsule(capsule) => capsule,
            QpairEvent::ConnectionError(err) => {
                return Err(qpair_error("connection failed", err));
            }
            QpairEvent::Data { .. } => continue,
        };
        pending -= 1;

        let cid = capsule.cid();
        if !capsule.is_success() {
            warn!(cid, error = ?capsule.transfer_error(), "command failed");
            report.failed += 1;
            continue;
        }
        match reads.remove(&cid) {
            Some(buffer) => {
                report.reads += 1;
                report.bytes_read += u64::from(size);
                if buffer.to_vec() != pattern(size as usize, !(cid as u8)) {
                    report.corrupt_reads += 1;
                }
            }
            None => {
                report.writes += 1;
                report.bytes_written += u64::from(size);
            }
        }
    }
    Ok(())
}

fn wait_closed(host: &QueuePair) {
    let start = Instant::now();
    while host.state() != DispatchState::Closed && start.elapsed() < COMPLETION_TIMEOUT {
        thread::sleep(Duration::from_millis(5));
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Deterministic fill so reads can be checked without a backing store.
fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

struct WriteInProgress {
    remaining: usize,
    failed: bool,
}

/// A controller that accepts every write and answers reads from [`pattern`]
/// seeded with the inverted command identifier.
struct Controller {
    worker: JoinHandle<()>,
}

impl Controller {
    fn spawn(config: QueuePairConfig, stream: WireStream) -> CliResult<Self> {
        let (tx, rx) = mpsc::channel();
        let qpair = QueuePair::spawn(config, stream, Arc::new(NoPlacement), Arc::new(tx))
            .map_err(|err| qpair_error("controller start failed", err))?;
        let worker = thread::Builder::new()
            .name("ctrl-serve".to_string())
            .spawn(move || serve(qpair, rx))
            .map_err(|err| io_error("controller start failed", err))?;
        Ok(Self { worker })
    }

    fn finish(self) {
        if self.worker.join().is_err() {
            warn!("controller thread panicked");
        }
    }
}

fn serve(qpair: QueuePair, events: Receiver<QpairEvent>) {
    let mut writes: HashMap<u16, WriteInProgress> = HashMap::new();
    let chunk = qpair.config().max_h2c_data;
    let c2h_success = qpair.config().c2h_success;

    loop {
        let event = match events.recv_timeout(Duration::from_millis(20)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) if qpair.state() == DispatchState::Closed => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            QpairEvent::Capsule(command) => {
                let Some(sqe) = command.sqe() else { continue };
                let cid = sqe.cid();
                let total = sqe.sgl_length();
                let result = match sqe.opcode() {
                    opcode::WRITE if matches!(command.payload(), Payload::Bytes(_)) => {
                        respond(&qpair, cid, status::SUCCESS)
                    }
                    opcode::WRITE => {
                        writes.insert(
                            cid,
                            WriteInProgress {
                                remaining: total as usize,
                                failed: false,
                            },
                        );
                        let mut offset = 0;
                        let mut result = Ok(());
                        while offset < total && result.is_ok() {
                            let len = chunk.min(total - offset);
                            result = qpair.receive_controller_data(
                                &command,
                                offset,
                                DataBuffer::new(len as usize),
                            );
                            offset += len;
                        }
                        result
                    }
                    opcode::READ => {
                        let data = pattern(total as usize, !(cid as u8));
                        let sent = qpair.send_controller_data(&command, 0, data);
                        if sent.is_ok() && !c2h_success {
                            respond(&qpair, cid, status::SUCCESS)
                        } else {
                            sent
                        }
                    }
                    _ => respond(&qpair, cid, status::SUCCESS),
                };
                if let Err(err) = result {
                    warn!(cid, error = %err, "controller could not serve command");
                }
            }
            QpairEvent::Data {
                capsule,
                buffer,
                result,
            } => {
                let cid = capsule.cid();
                let Some(write) = writes.get_mut(&cid) else { continue };
                write.remaining = write.remaining.saturating_sub(buffer.len());
                write.failed |= result.is_err();
                if write.remaining == 0 {
                    let status = if write.failed {
                        status::DATA_TRANSFER_ERROR
                    } else {
                        status::SUCCESS
                    };
                    writes.remove(&cid);
                    if let Err(err) = respond(&qpair, cid, status) {
                        warn!(cid, error = %err, "controller could not respond");
                    }
                }
            }
            QpairEvent::ConnectionError(err) => {
                info!(error = %err, "controller connection ended");
                break;
            }
        }
    }
    qpair.close();
}

fn respond(qpair: &QueuePair, cid: u16, status: u16) -> nvtcp_qpair::Result<()> {
    qpair.submit_capsule(Capsule::response(CompletionEntry::new(cid, status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_depends_on_seed() {
        assert_eq!(pattern(4, 0).as_ref(), &[0, 13, 26, 39]);
        assert_ne!(pattern(64, 1), pattern(64, 2));
    }
}
