use std::fs;

use bytes::BytesMut;
use nvtcp_pdu::{decode_pdu, validate, Pdu, PduConfig, PduType, COMMON_HEADER_SIZE};
use tracing::debug;

use crate::cmd::{usage, DecodeArgs};
use crate::exit::{io_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_pdus, OutputFormat, PduRow};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = match (&args.path, &args.hex) {
        (_, Some(hex)) => parse_hex(hex)?,
        (Some(path), None) => fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        (None, None) => return Err(usage("a capture file or --hex is required")),
    };

    let mut config = PduConfig {
        header_digest: args.header_digest,
        data_digest: args.data_digest,
        pda: args.pda,
        ..PduConfig::default()
    };
    if let Some(max) = args.max_pdu_size {
        config.max_pdu_size = max;
    }

    let rows = decode_stream(&bytes, &config);
    print_pdus(&rows, format);

    if rows.iter().any(|row| row.error.is_some()) {
        Ok(DATA_INVALID)
    } else {
        Ok(SUCCESS)
    }
}

/// Split `bytes` into PDUs and validate each one. Framing stops at the
/// first PDU whose length can't be trusted.
pub fn decode_stream(bytes: &[u8], config: &PduConfig) -> Vec<PduRow> {
    let mut buf = BytesMut::from(bytes);
    let mut rows = Vec::new();
    let mut offset = 0usize;

    loop {
        let header = header_fields(&buf);
        match decode_pdu(&mut buf, config.max_pdu_size) {
            Ok(Some(inbound)) => {
                let (pdu_type, hlen, pdo, plen) = header;
                let (summary, error) = match validate(&inbound, config) {
                    Ok(validated) => {
                        let mut summary = summarize(&validated.pdu);
                        if validated.data_digest_error {
                            summary.push_str(" ddgst=bad");
                        }
                        (summary, None)
                    }
                    Err(err) => (String::new(), Some(err.to_string())),
                };
                debug!(index = rows.len(), offset, plen, "decoded PDU");
                rows.push(PduRow {
                    index: rows.len(),
                    offset,
                    pdu_type,
                    hlen,
                    pdo,
                    plen,
                    summary,
                    error,
                });
                offset += inbound.bytes.len();
            }
            Ok(None) => {
                if !buf.is_empty() {
                    let (pdu_type, hlen, pdo, plen) = header;
                    rows.push(PduRow {
                        index: rows.len(),
                        offset,
                        pdu_type,
                        hlen,
                        pdo,
                        plen,
                        summary: String::new(),
                        error: Some(format!("truncated PDU ({} trailing bytes)", buf.len())),
                    });
                }
                break;
            }
            Err(err) => {
                let (pdu_type, hlen, pdo, plen) = header;
                rows.push(PduRow {
                    index: rows.len(),
                    offset,
                    pdu_type,
                    hlen,
                    pdo,
                    plen,
                    summary: String::new(),
                    error: Some(err.to_string()),
                });
                break;
            }
        }
    }
    rows
}

fn header_fields(buf: &[u8]) -> (String, u8, u8, u32) {
    if buf.len() < COMMON_HEADER_SIZE {
        let raw = buf.first().copied().unwrap_or_default();
        return (type_name(raw), 0, 0, 0);
    }
    let plen = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    (type_name(buf[0]), buf[2], buf[3], plen)
}

fn type_name(raw: u8) -> String {
    match PduType::from_raw(raw) {
        Some(pdu_type) => pdu_type.name().to_string(),
        None => format!("{raw:#04x}"),
    }
}

fn summarize(pdu: &Pdu) -> String {
    match pdu {
        Pdu::CapsuleCmd { sqe, data } => format!(
            "opcode={:#04x} cid={:#06x} sgl={} inline={}",
            sqe.opcode(),
            sqe.cid(),
            sqe.sgl_length(),
            data.len()
        ),
        Pdu::CapsuleResp { cqe } => {
            format!("cid={:#06x} status={:#06x}", cqe.cid(), cqe.status())
        }
        Pdu::H2CData(data) | Pdu::C2HData(data) => {
            let mut flags = String::new();
            if data.last {
                flags.push_str(" last");
            }
            if data.success {
                flags.push_str(" success");
            }
            format!(
                "cccid={:#06x} ttag={:#06x} datao={} datal={}{}",
                data.cccid, data.ttag, data.offset, data.length, flags
            )
        }
        Pdu::R2T(r2t) => format!(
            "cccid={:#06x} ttag={:#06x} r2to={} r2tl={}",
            r2t.cccid, r2t.ttag, r2t.offset, r2t.length
        ),
        Pdu::H2CTermReq(term) | Pdu::C2HTermReq(term) => format!(
            "fes={:?} fei={} echoed={}",
            term.fes,
            term.fei,
            term.header.len()
        ),
    }
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(usage("--hex needs an even number of digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap_or("zz");
            u8::from_str_radix(text, 16)
                .map_err(|_| usage(format!("--hex has an invalid byte: {text}")))
        })
        .collect()
}
