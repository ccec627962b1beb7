//! Host and controller queue pairs over a TCP loopback connection.
//!
//! The controller keeps written data in memory and serves reads from it.
//!
//! Run with:
//!   cargo run --example loopback

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use nvtcp::pdu::nvme::{opcode, status};
use nvtcp::pdu::{CompletionEntry, SubmissionEntry};
use nvtcp::wire::{NoPlacement, SoftwarePlacement, WireStream};
use nvtcp::{Capsule, DataBuffer, Payload, QpairEvent, QueuePair, QueuePairConfig};

const LEN: usize = 256 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let host_end = WireStream::connect(listener.local_addr()?)?;
    let ctrl_end = WireStream::from_tcp(listener.accept()?.0);

    let (ctrl_tx, ctrl_rx) = mpsc::channel();
    let controller = QueuePair::spawn(
        QueuePairConfig::controller("ctrl"),
        ctrl_end,
        Arc::new(NoPlacement),
        Arc::new(ctrl_tx),
    )?;
    let serve = thread::spawn(move || {
        let mut stored: HashMap<u16, Vec<u8>> = HashMap::new();
        let mut disk = Vec::new();
        while let Ok(event) = ctrl_rx.recv() {
            match event {
                QpairEvent::Capsule(command) => {
                    let Some(sqe) = command.sqe() else { continue };
                    let cid = sqe.cid();
                    match (sqe.opcode(), command.payload()) {
                        (opcode::WRITE, Payload::Bytes(data)) => {
                            disk = data.to_vec();
                            let _ = controller.submit_capsule(Capsule::response(
                                CompletionEntry::success(cid),
                            ));
                        }
                        (opcode::WRITE, _) => {
                            let buffer = DataBuffer::new(sqe.sgl_length() as usize);
                            let _ = controller.receive_controller_data(&command, 0, buffer);
                        }
                        (opcode::READ, _) => {
                            let _ = controller.send_controller_data(
                                &command,
                                0,
                                disk.clone().into(),
                            );
                            let _ = controller.submit_capsule(Capsule::response(
                                CompletionEntry::success(cid),
                            ));
                        }
                        _ => {
                            let _ = controller.submit_capsule(Capsule::response(
                                CompletionEntry::new(cid, status::INVALID_OPCODE),
                            ));
                        }
                    }
                }
                QpairEvent::Data {
                    capsule, buffer, ..
                } => {
                    stored.insert(capsule.cid(), buffer.to_vec());
                    disk = buffer.to_vec();
                    let _ = controller.submit_capsule(Capsule::response(
                        CompletionEntry::success(capsule.cid()),
                    ));
                }
                QpairEvent::ConnectionError(err) => {
                    eprintln!("controller: {err}");
                    break;
                }
            }
        }
        controller.close();
        stored.len()
    });

    let (host_tx, host_rx) = mpsc::channel();
    let host = QueuePair::spawn(
        QueuePairConfig::host("host"),
        host_end,
        Arc::new(SoftwarePlacement::new(16)),
        Arc::new(host_tx),
    )?;

    let data: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::WRITE, 1)).with_data(data.clone()))?;
    wait(&host_rx, "write")?;

    let dest = DataBuffer::new(LEN);
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 2)).with_buffer(dest.clone()))?;
    wait(&host_rx, "read")?;
    println!("read back {} bytes, match = {}", dest.len(), dest.to_vec() == data);

    host.close();
    let writes = serve.join().map_err(|_| "controller thread panicked")?;
    println!("controller saw {writes} R2T-driven write(s)");
    Ok(())
}

fn wait(events: &mpsc::Receiver<QpairEvent>, what: &str) -> Result<(), Box<dyn std::error::Error>> {
    match events.recv()? {
        QpairEvent::Capsule(capsule) if capsule.is_success() => {
            println!("{what} cid={} completed", capsule.cid());
            Ok(())
        }
        QpairEvent::Capsule(capsule) => {
            Err(format!("{what} failed: {:?}", capsule.transfer_error()).into())
        }
        other => Err(format!("{what}: unexpected event {other:?}").into()),
    }
}
