//! Frame Codec
//!
//! Frames travel over the adapter link as ASCII hex lines:
//!
//! ```text
//! K-line / J1850:  <header 3B> <data 1-7B> <checksum 1B> \r
//! ISO 15765-4:     <CAN id 2B|4B> <PCI> <data> [padding] \r
//! ```
//!
//! A complete response is one or more lines followed by the `>` prompt. CAN
//! replies longer than seven bytes arrive ISO-TP segmented (first frame plus
//! consecutive frames) and are reassembled here.

use tracing::trace;

use crate::error::ObdError;
use crate::message::{DiagnosticRequest, DiagnosticResponse, FrameMeta};
use crate::mode;
use crate::protocol::{ProtocolFamily, ProtocolId, PROMPT};

/// Data bytes in a classic CAN frame
const CAN_DATA_LEN: usize = 8;

/// Largest ISO-TP message (12-bit length field)
const ISOTP_MAX_LEN: usize = 0x0FFF;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Encode a request into one terminated frame line
pub fn encode(request: &DiagnosticRequest, protocol: ProtocolId) -> Result<Vec<u8>, ObdError> {
    request.validate()?;

    let data = request.data_bytes();
    let layout = protocol.layout();
    if data.len() > layout.max_payload {
        return Err(ObdError::PayloadTooLarge {
            size: data.len(),
            max: layout.max_payload,
        });
    }

    let header = protocol.request_header(data.len());
    let frame = if protocol.is_can() {
        can_single_frame(&header, &data)
    } else {
        checksummed_frame(protocol, &header, &data)
    };

    trace!(%protocol, frame = %hex::encode_upper(&frame), "Encoded request");
    Ok(render_line(&frame, layout.terminator))
}

/// Encode the reply an ECU at `ecu` would send, as terminated lines
///
/// CAN replies longer than a single frame are ISO-TP segmented. Other
/// families carry at most one message of `max_payload` bytes per call.
pub fn encode_response(protocol: ProtocolId, ecu: u8, data: &[u8]) -> Result<Vec<u8>, ObdError> {
    let layout = protocol.layout();
    let header = protocol.response_header(ecu, data.len());
    let mut out = Vec::new();

    if protocol.is_can() {
        if data.len() > ISOTP_MAX_LEN {
            return Err(ObdError::PayloadTooLarge {
                size: data.len(),
                max: ISOTP_MAX_LEN,
            });
        }
        if data.len() <= layout.max_payload {
            out.extend(render_line(&can_single_frame(&header, data), layout.terminator));
        } else {
            for frame in can_segmented_frames(&header, data) {
                out.extend(render_line(&frame, layout.terminator));
            }
        }
    } else {
        if data.is_empty() || data.len() > layout.max_payload {
            return Err(ObdError::PayloadTooLarge {
                size: data.len(),
                max: layout.max_payload,
            });
        }
        out.extend(render_line(
            &checksummed_frame(protocol, &header, data),
            layout.terminator,
        ));
    }

    Ok(out)
}

/// Decode raw link bytes into the response of the first ECU that answered
pub fn decode(bytes: &[u8], protocol: ProtocolId) -> Result<DiagnosticResponse, ObdError> {
    let bytes = match bytes.iter().position(|&b| b == PROMPT) {
        Some(end) => &bytes[..end],
        None => bytes,
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ObdError::MalformedFrame("non-ASCII bytes on link".to_string()))?;

    let mut segments: Vec<&str> = text.split(|c: char| c == '\r' || c == '\n').collect();
    // Text after the last terminator is a frame still being received
    let unterminated = segments.pop().map(str::trim).unwrap_or_default();

    let mut frames = Vec::new();
    let mut saw_no_data = false;
    for line in segments.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        if !line.chars().all(|c| c.is_ascii_hexdigit() || c == ' ') {
            match classify_status(line) {
                AdapterStatus::Searching => continue,
                AdapterStatus::NoData => {
                    saw_no_data = true;
                    continue;
                }
                AdapterStatus::Failure => {
                    return Err(ObdError::MalformedFrame(format!("adapter reported `{line}`")))
                }
            }
        }
        frames.push(parse_frame(line, protocol)?);
    }

    if !unterminated.is_empty() {
        return Err(ObdError::IncompleteFrame(format!(
            "unterminated frame `{unterminated}`"
        )));
    }

    let Some(first) = frames.first() else {
        return Err(if saw_no_data {
            ObdError::NoData
        } else {
            ObdError::IncompleteFrame("no complete frame received".to_string())
        });
    };

    let source = first.source;
    let header = first.header.clone();
    let from_source: Vec<RawFrame> = frames.into_iter().filter(|f| f.source == source).collect();
    let frame_count = from_source.len();

    let messages = if protocol.is_can() {
        reassemble_isotp(&from_source)?
    } else {
        from_source.into_iter().map(|f| f.data).collect()
    };

    let (mode, pid, payload) = merge_messages(&messages)?;
    Ok(DiagnosticResponse {
        mode,
        pid,
        payload,
        meta: FrameMeta {
            protocol,
            header,
            source,
            frame_count,
        },
    })
}

fn render_line(frame: &[u8], terminator: u8) -> Vec<u8> {
    let mut line = hex::encode_upper(frame).into_bytes();
    line.push(terminator);
    line
}

fn checksummed_frame(protocol: ProtocolId, header: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + data.len() + 1);
    frame.extend_from_slice(header);
    frame.extend_from_slice(data);
    if let Some(sum) = protocol.layout().checksum.compute(&frame) {
        frame.push(sum);
    }
    frame
}

fn can_single_frame(header: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(header.len() + CAN_DATA_LEN);
    frame.extend_from_slice(header);
    frame.push((PCI_SINGLE << 4) | data.len() as u8);
    frame.extend_from_slice(data);
    frame.resize(header.len() + CAN_DATA_LEN, 0x00);
    frame
}

fn can_segmented_frames(header: &[u8], data: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    let mut first = header.to_vec();
    first.push((PCI_FIRST << 4) | ((data.len() >> 8) as u8 & 0x0F));
    first.push(data.len() as u8);
    first.extend_from_slice(&data[..6]);
    frames.push(first);

    for (i, chunk) in data[6..].chunks(7).enumerate() {
        let mut frame = header.to_vec();
        frame.push((PCI_CONSECUTIVE << 4) | ((i + 1) as u8 & 0x0F));
        frame.extend_from_slice(chunk);
        frame.resize(header.len() + CAN_DATA_LEN, 0x00);
        frames.push(frame);
    }
    frames
}

enum AdapterStatus {
    Searching,
    NoData,
    Failure,
}

fn classify_status(line: &str) -> AdapterStatus {
    let upper = line.to_ascii_uppercase();
    if upper.starts_with("SEARCHING") {
        AdapterStatus::Searching
    } else if upper.contains("NO DATA") {
        AdapterStatus::NoData
    } else {
        AdapterStatus::Failure
    }
}

#[derive(Debug)]
struct RawFrame {
    header: Vec<u8>,
    source: u32,
    data: Vec<u8>,
}

fn parse_frame(line: &str, protocol: ProtocolId) -> Result<RawFrame, ObdError> {
    let mut digits: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 == 1 {
        if protocol.family() == ProtocolFamily::Can11 {
            // 11-bit ids print as three hex digits
            digits.insert(0, '0');
        } else {
            return Err(ObdError::MalformedFrame(format!("odd hex length in `{line}`")));
        }
    }
    let bytes = hex::decode(&digits)
        .map_err(|e| ObdError::MalformedFrame(format!("bad hex in `{line}`: {e}")))?;

    let layout = protocol.layout();
    let trailer = layout.checksum.width();
    if bytes.len() < layout.header_len + 1 + trailer {
        return Err(ObdError::MalformedFrame(format!(
            "frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    }

    let body_end = bytes.len() - trailer;
    if let Some(expected) = layout.checksum.compute(&bytes[..body_end]) {
        let actual = bytes[body_end];
        if expected != actual {
            return Err(ObdError::ChecksumMismatch { expected, actual });
        }
    }

    let header = bytes[..layout.header_len].to_vec();
    let data = bytes[layout.header_len..body_end].to_vec();

    let source = match protocol.family() {
        ProtocolFamily::Can11 => u16::from_be_bytes([header[0], header[1]]) as u32,
        ProtocolFamily::Can29 => u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
        _ => header[2] as u32,
    };

    match protocol.family() {
        ProtocolFamily::Can11 | ProtocolFamily::Can29 => {
            if data.len() > CAN_DATA_LEN {
                return Err(ObdError::MalformedFrame(format!(
                    "CAN frame carries {} data bytes",
                    data.len()
                )));
            }
        }
        ProtocolFamily::Iso14230 => {
            let format = header[0];
            if format & 0x80 == 0 {
                return Err(ObdError::MalformedFrame(format!(
                    "format byte {format:02X} lacks address information"
                )));
            }
            let declared = (format & 0x3F) as usize;
            if declared != data.len() {
                return Err(ObdError::MalformedFrame(format!(
                    "format byte declares {declared} data bytes, frame has {}",
                    data.len()
                )));
            }
        }
        ProtocolFamily::J1850 | ProtocolFamily::Iso9141 => {
            if data.len() > layout.max_payload {
                return Err(ObdError::MalformedFrame(format!(
                    "frame carries {} data bytes, limit is {}",
                    data.len(),
                    layout.max_payload
                )));
            }
        }
    }

    Ok(RawFrame {
        header,
        source,
        data,
    })
}

fn reassemble_isotp(frames: &[RawFrame]) -> Result<Vec<Vec<u8>>, ObdError> {
    let mut messages = Vec::new();
    // (declared length, bytes so far, next sequence number)
    let mut pending: Option<(usize, Vec<u8>, u8)> = None;

    for frame in frames {
        let data = &frame.data;
        let Some(&pci) = data.first() else {
            return Err(ObdError::MalformedFrame("CAN frame without PCI".to_string()));
        };

        match pci >> 4 {
            PCI_SINGLE => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || len + 1 > data.len() {
                    return Err(ObdError::MalformedFrame(format!(
                        "single frame length {len} invalid for {} bytes",
                        data.len()
                    )));
                }
                messages.push(data[1..1 + len].to_vec());
            }
            PCI_FIRST => {
                if data.len() < 2 {
                    return Err(ObdError::MalformedFrame("truncated first frame".to_string()));
                }
                let total = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                if total <= 7 {
                    return Err(ObdError::MalformedFrame(format!(
                        "first frame declares only {total} bytes"
                    )));
                }
                let mut buf = Vec::with_capacity(total);
                buf.extend_from_slice(&data[2..]);
                pending = Some((total, buf, 1));
            }
            PCI_CONSECUTIVE => {
                let Some((total, buf, expected)) = pending.as_mut() else {
                    return Err(ObdError::MalformedFrame(
                        "consecutive frame without first frame".to_string(),
                    ));
                };
                let seq = pci & 0x0F;
                if seq != *expected {
                    return Err(ObdError::MalformedFrame(format!(
                        "sequence mismatch: expected {expected}, got {seq}"
                    )));
                }
                *expected = (*expected + 1) & 0x0F;
                let take = (*total - buf.len()).min(data.len() - 1);
                buf.extend_from_slice(&data[1..1 + take]);
                if buf.len() >= *total {
                    if let Some((_, done, _)) = pending.take() {
                        messages.push(done);
                    }
                }
            }
            PCI_FLOW_CONTROL => continue,
            other => {
                return Err(ObdError::MalformedFrame(format!(
                    "unknown PCI type {other:X}"
                )))
            }
        }
    }

    if let Some((total, buf, _)) = pending {
        return Err(ObdError::IncompleteFrame(format!(
            "received {} of {total} segmented bytes",
            buf.len()
        )));
    }
    Ok(messages)
}

fn merge_messages(messages: &[Vec<u8>]) -> Result<(u8, Option<u8>, Vec<u8>), ObdError> {
    let mut mode_byte = None;
    let mut pid = None;
    let mut payload = Vec::new();

    for message in messages {
        let Some(&m) = message.first() else {
            return Err(ObdError::MalformedFrame("empty message".to_string()));
        };
        let carries_pid = m != mode::NEGATIVE_RESPONSE && mode::has_pid(m & !mode::RESPONSE_OFFSET);
        let this_pid = if carries_pid {
            Some(*message.get(1).ok_or_else(|| {
                ObdError::MalformedFrame(format!("mode {m:02X} reply without PID"))
            })?)
        } else {
            None
        };

        match mode_byte {
            None => {
                mode_byte = Some(m);
                pid = this_pid;
            }
            Some(first) if first != m || pid != this_pid => {
                return Err(ObdError::MalformedFrame(format!(
                    "mixed replies {first:02X}/{m:02X} from one ECU"
                )));
            }
            Some(_) => {}
        }
        let offset = if carries_pid { 2 } else { 1 };
        payload.extend_from_slice(&message[offset..]);
    }

    let mode = mode_byte.ok_or_else(|| ObdError::IncompleteFrame("no message".to_string()))?;
    Ok((mode, pid, payload))
}
