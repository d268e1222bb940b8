//! Message framing strategies.
//!
//! A codec turns a byte stream into discrete messages and back. The core
//! only needs the two-operation contract: try-decode and encode. A codec
//! instance is cloned per accepted connection on a server, never shared.

use std::ops::Range;

use crate::buffer::Buffer;

/// Decode error types. Any decode error closes the connection; protocol
/// corruption is not recoverable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// Frame header or delimiter is malformed.
    #[error("invalid frame")]
    Invalid,
    /// Declared frame length exceeds the configured limit.
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// A successfully decoded message: how many input bytes it consumed and
/// where the payload sits within them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub consumed: usize,
    pub payload: Range<usize>,
}

/// Pluggable framing strategy. Shared references only ever clone; each
/// connection works on its own exclusively-owned instance.
pub trait Codec: Send + Sync {
    /// Try to decode one message from the front of `input`. `Ok(None)` means
    /// more data is needed.
    fn try_decode(&mut self, input: &[u8]) -> Result<Option<Frame>, ParseError>;

    /// Append the framed encoding of `payload` to `out`.
    fn encode(&mut self, payload: &[u8], out: &mut Buffer);

    /// Clone for per-connection use.
    fn clone_box(&self) -> Box<dyn Codec>;
}

/// Frames each message with a 4-byte big-endian length prefix.
#[derive(Debug, Clone)]
pub struct LengthCodec {
    max_frame: usize,
}

impl Default for LengthCodec {
    fn default() -> Self {
        LengthCodec {
            max_frame: 16 * 1024 * 1024,
        }
    }
}

impl LengthCodec {
    pub fn new(max_frame: usize) -> LengthCodec {
        LengthCodec { max_frame }
    }
}

impl Codec for LengthCodec {
    fn try_decode(&mut self, input: &[u8]) -> Result<Option<Frame>, ParseError> {
        if input.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if len > self.max_frame {
            return Err(ParseError::Oversized(len));
        }
        if input.len() < 4 + len {
            return Ok(None);
        }
        Ok(Some(Frame {
            consumed: 4 + len,
            payload: 4..4 + len,
        }))
    }

    fn encode(&mut self, payload: &[u8], out: &mut Buffer) {
        out.append(&(payload.len() as u32).to_be_bytes());
        out.append(payload);
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

/// Frames each message as a line. Decoding splits on `\n` and strips an
/// optional trailing `\r`; encoding appends `\r\n`.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        LineCodec {
            max_line: 1024 * 1024,
        }
    }
}

impl LineCodec {
    pub fn new(max_line: usize) -> LineCodec {
        LineCodec { max_line }
    }
}

impl Codec for LineCodec {
    fn try_decode(&mut self, input: &[u8]) -> Result<Option<Frame>, ParseError> {
        match input.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let end = if pos > 0 && input[pos - 1] == b'\r' {
                    pos - 1
                } else {
                    pos
                };
                Ok(Some(Frame {
                    consumed: pos + 1,
                    payload: 0..end,
                }))
            }
            None if input.len() > self.max_line => Err(ParseError::Oversized(input.len())),
            None => Ok(None),
        }
    }

    fn encode(&mut self, payload: &[u8], out: &mut Buffer) {
        out.append(payload);
        out.append(b"\r\n");
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_codec_incremental() {
        let mut codec = LengthCodec::default();
        assert_eq!(codec.try_decode(b"\x00\x00").unwrap(), None);
        assert_eq!(codec.try_decode(b"\x00\x00\x00\x05hel").unwrap(), None);
        let frame = codec
            .try_decode(b"\x00\x00\x00\x05hello\x00")
            .unwrap()
            .unwrap();
        assert_eq!(frame.consumed, 9);
        assert_eq!(&b"\x00\x00\x00\x05hello\x00"[frame.payload], b"hello");
    }

    #[test]
    fn test_length_codec_roundtrip_through_buffer() {
        let mut codec = LengthCodec::default();
        let mut out = Buffer::new();
        codec.encode(b"hello", &mut out);
        assert_eq!(out.data(), b"\x00\x00\x00\x05hello");
        let frame = codec.try_decode(out.data()).unwrap().unwrap();
        assert_eq!(&out.data()[frame.payload], b"hello");
    }

    #[test]
    fn test_length_codec_rejects_oversized() {
        let mut codec = LengthCodec::new(16);
        let r = codec.try_decode(b"\x00\x00\x00\x20rest");
        assert!(matches!(r, Err(ParseError::Oversized(32))));
    }

    #[test]
    fn test_line_codec_splits_and_strips() {
        let mut codec = LineCodec::default();
        assert_eq!(codec.try_decode(b"partial").unwrap(), None);
        let input = b"first\r\nsecond\n";
        let frame = codec.try_decode(input).unwrap().unwrap();
        assert_eq!(frame.consumed, 7);
        assert_eq!(&input[frame.payload.clone()], b"first");
        let rest = &input[frame.consumed..];
        let frame = codec.try_decode(rest).unwrap().unwrap();
        assert_eq!(&rest[frame.payload], b"second");
    }

    #[test]
    fn test_line_codec_overlong_line() {
        let mut codec = LineCodec::new(8);
        assert!(codec.try_decode(b"0123456789abcdef").is_err());
    }
}
