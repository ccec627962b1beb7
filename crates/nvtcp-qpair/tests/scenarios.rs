#![cfg(unix)]

mod common;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nvtcp_pdu::nvme::{opcode, status};
use nvtcp_pdu::types::field;
use nvtcp_pdu::{
    encode_pdu, CompletionEntry, DataPdu, FatalErrorStatus, Pdu, PduType, SubmissionEntry,
};
use nvtcp_qpair::{
    Capsule, DataBuffer, DispatchState, QpairError, QueuePairConfig, TransferError,
};
use nvtcp_wire::{PlacementEvent, PlacementService, SoftwarePlacement, WireStream};

use common::{
    host_config, pattern, spawn_host, spawn_tapped_host, wait_for_state, RawPeer, Target,
};

fn software(capacity: usize) -> Arc<SoftwarePlacement> {
    Arc::new(SoftwarePlacement::new(capacity))
}

fn raw_controller(stream: WireStream, config: &QueuePairConfig) -> RawPeer {
    RawPeer::new(stream, config.pdu_config())
}

fn expect_command(peer: &mut RawPeer) -> SubmissionEntry {
    match peer.recv() {
        Pdu::CapsuleCmd { sqe, .. } => sqe,
        other => panic!("expected command, got {other:?}"),
    }
}

fn c2h(cccid: u16, offset: u32, data: &[u8], last: bool) -> Pdu {
    Pdu::C2HData(DataPdu {
        cccid,
        ttag: 0,
        offset,
        length: data.len() as u32,
        last,
        success: false,
        data: Bytes::copy_from_slice(data),
    })
}

#[test]
fn small_write_travels_inside_the_capsule() {
    let (host_end, ctrl_end) = WireStream::pair().unwrap();
    let target = Target::spawn(
        common::controller_config("ctrl"),
        ctrl_end,
        software(8),
        64 * 1024,
    );
    let placement = software(8);
    let (host, events, sent) = spawn_tapped_host(
        host_config("host"),
        host_end,
        Arc::clone(&placement) as Arc<dyn PlacementService>,
    );

    let data = pattern(4096, 1);
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::WRITE, 17)).with_data(data.clone()))
        .unwrap();

    let done = events.completion();
    assert_eq!(done.cid(), 17);
    assert!(done.is_success());
    assert_eq!(host.live_tags(), 0);
    assert_eq!(host.outstanding(), 0);
    assert!(placement.events().is_empty(), "no placement for an immediate write");

    let sent = sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].pdu_type, PduType::CapsuleCmd);

    host.close();
    let log = target.finish();
    assert_eq!(log.commands, [(17, opcode::WRITE, 4096)]);
    assert_eq!(log.writes[&17], data);
    assert_eq!(log.r2t_buffers, 0);
}

#[test]
fn large_write_splits_into_h2c_data() {
    let (host_end, ctrl_end) = WireStream::pair().unwrap();
    let target = Target::spawn(
        common::controller_config("ctrl"),
        ctrl_end,
        software(8),
        1024 * 1024,
    );
    let mut config = host_config("host");
    config.accelerated_tags = 0;
    let max_h2c = config.max_h2c_data as usize;
    let (host, events, sent) = spawn_tapped_host(config, host_end, software(8));

    let data = pattern(1024 * 1024, 9);
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::WRITE, 3)).with_data(data.clone()))
        .unwrap();

    let done = events.completion();
    assert_eq!(done.cid(), 3);
    assert!(done.is_success());

    let data_pdus: Vec<_> = sent
        .lock()
        .iter()
        .copied()
        .filter(|pdu| pdu.pdu_type == PduType::H2CData)
        .collect();
    assert_eq!(data_pdus.len(), data.len().div_ceil(max_h2c));
    assert!(data_pdus.iter().all(|pdu| pdu.length as usize <= max_h2c));
    let lasts: Vec<bool> = data_pdus.iter().map(|pdu| pdu.last).collect();
    assert_eq!(lasts.iter().filter(|last| **last).count(), 1);
    assert_eq!(lasts.last(), Some(&true));

    host.close();
    let log = target.finish();
    assert_eq!(log.commands, [(0x8000, opcode::WRITE, 0)]);
    assert_eq!(log.writes[&0x8000], data);
}

#[test]
fn out_of_order_data_on_plain_tag_terminates() {
    let (host_end, ctrl_end) = WireStream::pair().unwrap();
    let mut config = host_config("host");
    config.accelerated_tags = 0;
    config.termination_grace_ms = 200;
    let mut peer = raw_controller(ctrl_end, &config);
    let (host, events) = spawn_host(config, host_end, software(8));

    host.submit_capsule(
        Capsule::command(SubmissionEntry::new(opcode::READ, 5)).with_buffer(DataBuffer::new(8192)),
    )
    .unwrap();
    let sqe = expect_command(&mut peer);
    assert_eq!(sqe.cid(), 0x8000);

    peer.send(&c2h(0x8000, 4096, &[0u8; 4096], true));
    match peer.recv() {
        Pdu::H2CTermReq(term) => {
            assert_eq!(term.fes, FatalErrorStatus::PduSequenceError);
            assert_eq!(term.fei, field::DATAO);
            assert_eq!(term.header[0], PduType::C2HData as u8);
        }
        other => panic!("expected termination request, got {other:?}"),
    }
    wait_for_state(&host, &[DispatchState::Terminating, DispatchState::Closed]);

    // Ignored: the connection is terminating.
    peer.send(&Pdu::CapsuleResp {
        cqe: CompletionEntry::success(0x8000),
    });

    let done = events.completion();
    assert_eq!(done.cid(), 5);
    assert_eq!(done.transfer_error(), Some(TransferError::ConnectionAborted));
    assert_eq!(done.cqe().map(|cqe| cqe.status()), Some(status::ABORTED_SQ_DELETION));
    assert!(matches!(
        events.connection_error(),
        QpairError::Sequence {
            fes: FatalErrorStatus::PduSequenceError,
            ..
        }
    ));
    wait_for_state(&host, &[DispatchState::Closed]);
    assert!(peer.try_recv().is_none());
}

#[test]
fn data_digest_mismatch_completes_with_transfer_error() {
    let (host_end, ctrl_end) = WireStream::pair().unwrap();
    let mut config = host_config("host");
    config.data_digest = true;
    config.header_digest = true;
    let mut peer = raw_controller(ctrl_end, &config);
    let (host, events) = spawn_host(config, host_end, software(8));

    let dest = DataBuffer::new(2048);
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 8)).with_buffer(dest.clone()))
        .unwrap();
    let wire_cid = expect_command(&mut peer).cid();

    let mut buf = BytesMut::new();
    encode_pdu(&c2h(wire_cid, 0, &pattern(2048, 4), true), peer.config(), &mut buf).unwrap();
    let len = buf.len();
    buf[len - 2] ^= 0x5a;
    peer.send_raw(&buf);
    peer.send(&Pdu::CapsuleResp {
        cqe: CompletionEntry::success(wire_cid),
    });

    let done = events.completion();
    assert_eq!(done.cid(), 8);
    assert_eq!(done.transfer_error(), Some(TransferError::DataDigest));
    assert_eq!(done.cqe().map(|cqe| cqe.status()), Some(status::DATA_TRANSFER_ERROR));
    assert_eq!(dest.to_vec(), pattern(2048, 4), "payload is still delivered");
    assert_eq!(host.state(), DispatchState::Idle);
    assert_eq!(host.live_tags(), 0);
}

#[test]
fn teardown_aborts_both_tag_kinds() {
    let (host_end, ctrl_end) = WireStream::pair().unwrap();
    let config = host_config("host");
    let mut peer = raw_controller(ctrl_end, &config);
    let placement = software(8);
    let (host, events) = spawn_host(
        config,
        host_end,
        Arc::clone(&placement) as Arc<dyn PlacementService>,
    );

    let read = DataBuffer::new(16 * 1024);
    host.submit_capsule(Capsule::command(SubmissionEntry::new(opcode::READ, 1)).with_buffer(read))
        .unwrap();
    host.submit_capsule(
        Capsule::command(SubmissionEntry::new(opcode::WRITE, 2)).with_data(pattern(64 * 1024, 2)),
    )
    .unwrap();

    let read_tag = expect_command(&mut peer).cid();
    let write_tag = expect_command(&mut peer).cid();
    assert!(read_tag < 0x8000, "read uses an accelerated tag");
    assert!(write_tag >= 0x8000, "write uses a plain tag");
    assert_eq!(placement.live_count(), 1);
    assert_eq!(host.outstanding(), 2);

    host.shutdown();
    let mut aborted = vec![events.completion(), events.completion()];
    aborted.sort_by_key(|capsule| capsule.cid());
    assert_eq!(aborted[0].cid(), 1);
    assert_eq!(aborted[1].cid(), 2);
    assert!(aborted
        .iter()
        .all(|capsule| capsule.transfer_error() == Some(TransferError::ConnectionAborted)));

    assert_eq!(host.live_tags(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(placement.live_count(), 0);
    assert!(placement
        .events()
        .iter()
        .any(|event| matches!(event, PlacementEvent::Deregistered(_))));
    assert!(peer.try_recv().is_none());
}
