//! GWGJ wire protocol implementation.
//! Frames are ASCII text `START <content> check='<n>' END`, delimited by `END`.
//! Decoding is an accumulate-then-scan over a per-connection byte buffer.

use crate::error::{PduError, Result};
use regex::Regex;
use std::sync::OnceLock;

pub const FRAME_START: &str = "START";
pub const FRAME_END: &[u8] = b"END";
/// Raw (unframed) reply to a successful handshake.
pub const LOGIN_ACK: &[u8] = b"Login Successful";
/// Frames longer than this without a terminator are discarded.
pub const MAX_FRAME_LEN: usize = 4096;

pub const REQ_IOSTATE: &str = "iostate";
pub const REQ_PVC: &str = "PVC_get";

const VERB_OPEN: &str = "open";
const VERB_CLOSE: &str = "close";
const VERB_IOSTATE: &str = "iostate";
const VERB_PVC: &str = "PVC";

const KEY_ID: &str = "id";
const KEY_NUM: &str = "num";
const KEY_IO: &str = "io";
const KEY_POWER: &str = "p";
const KEY_VOLTAGE: &str = "v";
const KEY_CURRENT: &str = "a";

/// Highest outlet addressable through a single `io` bit.
const MAX_OUTLET: usize = 32;

static ATTR_RE: OnceLock<Regex> = OnceLock::new();
static CHECK_RE: OnceLock<Regex> = OnceLock::new();

fn attr_re() -> &'static Regex {
    // key, optional numeric suffix, quoted value: io8='3', A12='150', id='PDU01'
    ATTR_RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_]+)(\d*)='([^']*)'").expect("attribute pattern is valid")
    })
}

fn check_re() -> &'static Regex {
    CHECK_RE.get_or_init(|| {
        Regex::new(r"\s*check='(\d*)'\s*$").expect("checksum pattern is valid")
    })
}

/// A decoded GWGJ message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// First frame of a connection, identifies the device.
    Handshake {
        device_id: String,
        outlet_count: Option<usize>,
    },
    /// Whole-unit PVC reading plus any per-outlet currents in the same frame.
    Telemetry {
        voltage_v: f64,
        current_a: f64,
        power_w: f64,
        outlet_currents: Vec<(usize, f64)>,
    },
    /// Batched outlet states, bit `i-1` is outlet `i`.
    OutletState { mask: u32 },
    /// Device echo of an open/close command.
    CommandAck { index: usize, is_on: bool },
}

impl ProtocolMessage {
    /// Expands an `OutletState` mask to `(index, is_on)` for outlets `1..=outlet_count`.
    pub fn outlet_states(&self, outlet_count: usize) -> Vec<(usize, bool)> {
        match self {
            ProtocolMessage::OutletState { mask } => (1..=outlet_count.min(MAX_OUTLET))
                .map(|i| (i, mask & (1 << (i - 1)) != 0))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Result of scanning a buffer: zero or more messages and how many bytes they used.
#[derive(Debug, Default)]
pub struct Decoded {
    pub messages: Vec<Result<ProtocolMessage>>,
    pub consumed: usize,
}

struct Attr<'a> {
    key: String,
    index: Option<usize>,
    value: &'a str,
}

// -------------------------------------------------------------------------
// Decoding
// -------------------------------------------------------------------------

/// Scans `buf` for complete frames.
///
/// Trailing bytes that could still become a frame are left unconsumed; this
/// never reports an error for an incomplete prefix.
pub fn decode_frames(buf: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();

    while let Some(pos) = find(&buf[decoded.consumed..], FRAME_END) {
        let end = decoded.consumed + pos + FRAME_END.len();
        let raw = &buf[decoded.consumed..end];
        decoded.consumed = end;
        decoded.messages.push(parse_frame(raw));
    }

    let rest = buf.len() - decoded.consumed;
    if rest > MAX_FRAME_LEN {
        // The tail may hold the first bytes of a terminator.
        let keep = FRAME_END.len() - 1;
        decoded.messages.push(Err(PduError::Decode(format!(
            "discarded {} bytes without frame terminator",
            rest - keep
        ))));
        decoded.consumed = buf.len() - keep;
    }

    decoded
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses one complete frame candidate (everything up to and including `END`).
pub fn parse_frame(raw: &[u8]) -> Result<ProtocolMessage> {
    if raw.len() > MAX_FRAME_LEN {
        return Err(PduError::Decode(format!("frame too long ({} bytes)", raw.len())));
    }

    let text = String::from_utf8_lossy(raw);
    let start = text
        .find(FRAME_START)
        .ok_or_else(|| PduError::Decode(format!("no frame start in {:?}", text.trim())))?;
    let body_end = text.len().saturating_sub(FRAME_END.len());
    let body = text
        .get(start + FRAME_START.len()..body_end)
        .unwrap_or_default()
        .trim();

    let content = match check_re().find(body) {
        Some(m) => body[..m.start()].trim(),
        None => body,
    };

    classify(content)
}

fn classify(content: &str) -> Result<ProtocolMessage> {
    let attrs = attributes(content);
    let verb = content.split_whitespace().next().unwrap_or_default();

    match verb {
        VERB_OPEN | VERB_CLOSE => {
            let io = attr_u32(&attrs, KEY_IO, None)?
                .ok_or_else(|| PduError::Decode(format!("{} without io: {}", verb, content)))?;
            Ok(ProtocolMessage::CommandAck {
                index: outlet_from_io(io)?,
                is_on: verb == VERB_OPEN,
            })
        }
        VERB_IOSTATE => {
            let mask = attr_u32(&attrs, KEY_IO, Some(8))?
                .ok_or_else(|| PduError::Decode(format!("iostate without io8: {}", content)))?;
            Ok(ProtocolMessage::OutletState { mask })
        }
        VERB_PVC => parse_pvc(&attrs, content),
        _ => match attrs.iter().find(|a| a.key == KEY_ID && a.index.is_none()) {
            Some(id) if !id.value.trim().is_empty() => Ok(ProtocolMessage::Handshake {
                device_id: id.value.trim().to_string(),
                outlet_count: attr_u32(&attrs, KEY_NUM, None)?.map(|n| n as usize),
            }),
            _ => Err(PduError::Decode(format!("unknown frame: {}", content))),
        },
    }
}

fn parse_pvc(attrs: &[Attr<'_>], content: &str) -> Result<ProtocolMessage> {
    let missing = |what: &str| PduError::Decode(format!("PVC without {}: {}", what, content));

    let power = attr_i64(attrs, KEY_POWER, None)?.ok_or_else(|| missing("P"))?;
    let voltage = attr_i64(attrs, KEY_VOLTAGE, None)?.ok_or_else(|| missing("V"))?;
    let current = attr_i64(attrs, KEY_CURRENT, None)?.ok_or_else(|| missing("A"))?;

    let mut outlet_currents = Vec::new();
    for attr in attrs.iter().filter(|a| a.key == KEY_CURRENT) {
        if let Some(index) = attr.index {
            let milliamps: i64 = parse_int(attr)?;
            outlet_currents.push((index, round3(milliamps as f64 / 1000.0)));
        }
    }

    Ok(ProtocolMessage::Telemetry {
        voltage_v: round2(voltage as f64 / 100.0),
        current_a: round3(current as f64 / 1000.0),
        power_w: power as f64,
        outlet_currents,
    })
}

fn attributes(content: &str) -> Vec<Attr<'_>> {
    attr_re()
        .captures_iter(content)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let index = caps.get(2).and_then(|m| m.as_str().parse().ok());
            let value = caps.get(3)?.as_str();
            Some(Attr { key, index, value })
        })
        .collect()
}

fn find_attr<'a, 'b>(attrs: &'b [Attr<'a>], key: &str, index: Option<usize>) -> Option<&'b Attr<'a>> {
    attrs.iter().find(|a| a.key == key && a.index == index)
}

fn parse_int<T: std::str::FromStr>(attr: &Attr<'_>) -> Result<T> {
    attr.value.trim().parse().map_err(|_| {
        PduError::Decode(format!("{}='{}' is not an integer", attr.key, attr.value))
    })
}

fn attr_u32(attrs: &[Attr<'_>], key: &str, index: Option<usize>) -> Result<Option<u32>> {
    find_attr(attrs, key, index).map(parse_int).transpose()
}

fn attr_i64(attrs: &[Attr<'_>], key: &str, index: Option<usize>) -> Result<Option<i64>> {
    find_attr(attrs, key, index).map(parse_int).transpose()
}

/// Maps a single-bit `io` mask back to its 1-based outlet.
fn outlet_from_io(io: u32) -> Result<usize> {
    if io.is_power_of_two() {
        Ok(io.trailing_zeros() as usize + 1)
    } else {
        Err(PduError::Decode(format!("io='{}' does not address a single outlet", io)))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// -------------------------------------------------------------------------
// Encoding
// -------------------------------------------------------------------------

/// Sum of the content's characters modulo 256.
pub fn checksum(content: &str) -> u8 {
    (content.chars().map(|c| c as u32).sum::<u32>() % 256) as u8
}

/// Wraps `content` into a complete frame.
pub fn encode_frame(content: &str) -> Vec<u8> {
    format!("START {} check='{}' END", content, checksum(content)).into_bytes()
}

/// Builds the `open`/`close` frame for one outlet.
pub fn encode_switch(index: usize, is_on: bool) -> Result<Vec<u8>> {
    if index == 0 || index > MAX_OUTLET {
        return Err(PduError::InvalidOutlet {
            device_id: String::new(),
            index,
        });
    }
    let verb = if is_on { VERB_OPEN } else { VERB_CLOSE };
    let io = 1u64 << (index - 1);
    Ok(encode_frame(&format!("{} io='{}'", verb, io)))
}

/// Accumulates socket reads and hands out complete messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decodes all complete frames and keeps only the unconsumed tail.
    pub fn drain_messages(&mut self) -> Vec<Result<ProtocolMessage>> {
        let decoded = decode_frames(&self.buf);
        self.buf.drain(..decoded.consumed);
        decoded.messages
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(encode_frame("id='PDU01' num='16'"));
        bytes.extend(encode_frame("PVC P='700' V='22010' A='3200' A1='150' A2='75'"));
        bytes.extend(encode_frame("iostate io8='5'"));
        bytes.extend(encode_frame("open io='4'"));
        bytes.extend(b"\r\n");
        bytes.extend(encode_frame("close io='128'"));
        bytes
    }

    fn decode_in_chunks(bytes: &[u8], split: &[usize]) -> Vec<Result<ProtocolMessage>> {
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        let mut last = 0;
        for &at in split.iter().chain(std::iter::once(&bytes.len())) {
            buffer.extend(&bytes[last..at]);
            out.extend(buffer.drain_messages());
            last = at;
        }
        out
    }

    #[test]
    fn decodes_every_frame_kind() {
        let msgs: Vec<_> = decode_frames(&stream())
            .messages
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(
            msgs,
            vec![
                ProtocolMessage::Handshake {
                    device_id: "PDU01".into(),
                    outlet_count: Some(16)
                },
                ProtocolMessage::Telemetry {
                    voltage_v: 220.1,
                    current_a: 3.2,
                    power_w: 700.0,
                    outlet_currents: vec![(1, 0.15), (2, 0.075)],
                },
                ProtocolMessage::OutletState { mask: 5 },
                ProtocolMessage::CommandAck {
                    index: 3,
                    is_on: true
                },
                ProtocolMessage::CommandAck {
                    index: 8,
                    is_on: false
                },
            ]
        );
    }

    #[test]
    fn chunking_does_not_change_output() {
        let bytes = stream();
        let whole = decode_in_chunks(&bytes, &[]);

        for at in 1..bytes.len() {
            assert_eq!(decode_in_chunks(&bytes, &[at]), whole, "split at {}", at);
        }
        let every_byte: Vec<usize> = (1..bytes.len()).collect();
        assert_eq!(decode_in_chunks(&bytes, &every_byte), whole);
        let uneven: Vec<usize> = (1..bytes.len()).filter(|i| i % 7 == 0 || i % 11 == 0).collect();
        assert_eq!(decode_in_chunks(&bytes, &uneven), whole);
    }

    #[test]
    fn partial_frame_is_retained() {
        let mut bytes = encode_frame("iostate io8='255'");
        let partial = b"START PVC P='1".to_vec();
        bytes.extend(&partial);

        let decoded = decode_frames(&bytes);
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(&bytes[decoded.consumed..], partial.as_slice());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.drain_messages().len(), 1);
        assert_eq!(buffer.pending(), partial.as_slice());
    }

    #[test]
    fn incomplete_terminator_is_not_an_error() {
        let decoded = decode_frames(b"START iostate io8='1' check='1' EN");
        assert!(decoded.messages.is_empty());
        assert_eq!(decoded.consumed, 0);
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        let decoded = decode_frames(b"garbage END START hello world END");
        assert_eq!(decoded.messages.len(), 2);
        assert!(matches!(decoded.messages[0], Err(PduError::Decode(_))));
        assert!(matches!(decoded.messages[1], Err(PduError::Decode(_))));

        let missing_voltage = parse_frame(&encode_frame("PVC P='700' A='3200'"));
        assert!(matches!(missing_voltage, Err(PduError::Decode(_))));

        let multi_bit = parse_frame(&encode_frame("open io='3'"));
        assert!(matches!(multi_bit, Err(PduError::Decode(_))));
    }

    #[test]
    fn junk_before_start_is_skipped() {
        let mut bytes = b"\x00\xffnoise".to_vec();
        bytes.extend(encode_frame("iostate io8='2'"));
        let decoded = decode_frames(&bytes);
        assert_eq!(
            decoded.messages,
            vec![Ok(ProtocolMessage::OutletState { mask: 2 })]
        );
    }

    #[test]
    fn oversized_garbage_is_discarded() {
        let bytes = vec![b'x'; MAX_FRAME_LEN + 10];
        let decoded = decode_frames(&bytes);
        assert_eq!(decoded.messages.len(), 1);
        assert!(decoded.messages[0].is_err());
        assert_eq!(decoded.consumed, bytes.len() - 2);
    }

    #[test]
    fn checksum_and_switch_encoding() {
        assert_eq!(checksum("iostate"), (b"iostate".iter().map(|&b| b as u32).sum::<u32>() % 256) as u8);
        assert_eq!(
            String::from_utf8(encode_switch(3, true).unwrap()).unwrap(),
            format!("START open io='4' check='{}' END", checksum("open io='4'"))
        );
        assert!(encode_switch(0, true).is_err());
        assert!(encode_switch(33, false).is_err());
    }

    #[test]
    fn outlet_state_expansion() {
        let msg = ProtocolMessage::OutletState { mask: 0b1010 };
        assert_eq!(
            msg.outlet_states(4),
            vec![(1, false), (2, true), (3, false), (4, true)]
        );
    }
}
