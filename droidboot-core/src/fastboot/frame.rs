//! Wire framing for fastboot command packets and responses.

use core::fmt::Write as _;

use heapless::{String as HeaplessString, Vec as HeaplessVec};
use winnow::ModalResult;
use winnow::ascii::hex_uint;
use winnow::combinator::{alt, eof, opt, preceded, terminated};
use winnow::error::ContextError;
use winnow::prelude::*;

/// Largest command packet accepted from the host.
pub const MAX_COMMAND_LEN: usize = 64;

/// Largest response frame written to the host.
pub const MAX_RESPONSE_LEN: usize = 64;

/// Fixed-capacity response frame.
pub type ResponseFrame = HeaplessVec<u8, MAX_RESPONSE_LEN>;

/// Four-byte response prefixes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResponseKind {
    /// Command completed successfully.
    Okay,
    /// Command failed.
    Fail,
    /// Progress text, followed by more frames.
    Info,
    /// Download handshake announcing the expected payload length.
    Data,
}

impl ResponseKind {
    /// ASCII prefix written ahead of the payload.
    #[must_use]
    pub const fn prefix(self) -> &'static [u8; 4] {
        match self {
            ResponseKind::Okay => b"OKAY",
            ResponseKind::Fail => b"FAIL",
            ResponseKind::Info => b"INFO",
            ResponseKind::Data => b"DATA",
        }
    }

    /// Returns `true` for responses that finish a command.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, ResponseKind::Okay | ResponseKind::Fail)
    }
}

/// Builds a response frame, truncating `payload` to fit.
#[must_use]
pub fn encode(kind: ResponseKind, payload: &[u8]) -> ResponseFrame {
    let mut frame = ResponseFrame::new();
    // The prefix always fits in an empty frame.
    let _ = frame.extend_from_slice(kind.prefix());
    let room = MAX_RESPONSE_LEN - frame.len();
    let _ = frame.extend_from_slice(&payload[..payload.len().min(room)]);
    frame
}

/// Builds the `DATA%08x` handshake frame.
#[must_use]
pub fn encode_data(length: u32) -> ResponseFrame {
    let mut digits: HeaplessString<8> = HeaplessString::new();
    // Eight hex digits always fit.
    let _ = write!(digits, "{length:08x}");
    encode(ResponseKind::Data, digits.as_bytes())
}

/// Strips trailing NUL, CR and LF bytes from a command packet.
#[must_use]
pub fn trim_packet(packet: &[u8]) -> &[u8] {
    let end = packet
        .iter()
        .rposition(|byte| !matches!(byte, 0 | b'\r' | b'\n'))
        .map_or(0, |index| index + 1);
    &packet[..end]
}

/// Parses the hexadecimal length argument of `download:`.
///
/// An optional `0x` prefix is accepted. Empty, non-hex or overlong values are
/// rejected.
pub fn parse_hex_length(text: &str) -> Option<u32> {
    hex_length.parse(text.trim()).ok()
}

fn hex_length(input: &mut &str) -> ModalResult<u32, ContextError> {
    terminated(preceded(opt(alt(("0x", "0X"))), hex_uint), eof).parse_next(input)
}

/// Classifies a response frame by its prefix.
#[cfg(test)]
fn decode(frame: &[u8]) -> Option<(ResponseKind, &[u8])> {
    if frame.len() < 4 {
        return None;
    }
    let (prefix, payload) = frame.split_at(4);
    let kind = [
        ResponseKind::Okay,
        ResponseKind::Fail,
        ResponseKind::Info,
        ResponseKind::Data,
    ]
    .into_iter()
    .find(|kind| kind.prefix() == prefix)?;
    Some((kind, payload))
}
