//! Line-delimited JSON framing for the control channel.
//!
//! Wraps [`LinesCodec`] so that one UTF-8 line carries one
//! [`ControlMessage`]. Lines that fail to parse are surfaced as
//! [`ControlLine::Malformed`] items instead of decoder errors: a
//! `FramedRead` stops yielding after its first error, and a bad line must
//! never close the channel.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::control::ControlMessage;
use crate::error::MirrorError;

/// Longest control line accepted before the rest of it is discarded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// One decoded line from the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// A well-formed resolution message.
    Message(ControlMessage),
    /// A line that was not a valid message. `line` is truncated for logging.
    Malformed { line: String, reason: String },
}

/// Codec for `{"width":W,"height":H}\n` lines.
#[derive(Debug)]
pub struct ControlCodec {
    lines: LinesCodec,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }

    fn classify(line: String) -> ControlLine {
        match serde_json::from_str::<ControlMessage>(&line) {
            Ok(msg) => match msg.resolution() {
                Ok(_) => ControlLine::Message(msg),
                Err(e) => ControlLine::Malformed {
                    line: preview(&line),
                    reason: e.to_string(),
                },
            },
            Err(e) => ControlLine::Malformed {
                line: preview(&line),
                reason: e.to_string(),
            },
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlLine;
    type Error = MirrorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r');
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(Self::classify(line.to_string())));
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(ControlLine::Malformed {
                        line: String::new(),
                        reason: format!("line exceeds {MAX_LINE_LENGTH} bytes"),
                    }));
                }
                Err(e) if is_invalid_utf8(&e) => return Ok(Some(invalid_utf8_line())),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        // No newline left; whatever remains is a final unterminated line.
        match self.lines.decode_eof(buf) {
            Ok(Some(line)) if !line.trim().is_empty() => Ok(Some(Self::classify(line))),
            Ok(_) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(None),
            Err(e) if is_invalid_utf8(&e) => Ok(Some(invalid_utf8_line())),
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = MirrorError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// `LinesCodec` splits the line off the buffer before checking UTF-8, so
/// decoding can carry on past it.
fn is_invalid_utf8(e: &LinesCodecError) -> bool {
    matches!(e, LinesCodecError::Io(io) if io.kind() == std::io::ErrorKind::InvalidData)
}

fn invalid_utf8_line() -> ControlLine {
    ControlLine::Malformed {
        line: String::new(),
        reason: "invalid utf-8".into(),
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 80;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}
