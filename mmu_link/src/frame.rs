//! Textual wire framing
//!
//! Every message is a single line: `<payload>*<crc>\n`. The payload of a request is the command
//! letter followed by a lowercase hexadecimal value and, for register writes, a space and a second
//! hexadecimal value. A response echoes the request's letter and value, then a space and a
//! parameter token (see [`ParamCode`]) with an optional hexadecimal value. The checksum is
//! [`crc8`] over the payload bytes, rendered in lowercase hexadecimal without padding.

use crate::crc::crc8;
use crate::message::{ParamCode, RequestCode, RequestMsg, ResponseMsg};
use core::fmt::{self, Write};

/// Longest line accepted or produced, terminator included
pub const MAX_FRAME_LEN: usize = 32;

const MESSAGE_CRC_MARK: u8 = b'*';
const MESSAGE_TERMINATOR: u8 = b'\n';
const MESSAGE_SEPARATOR: u8 = b' ';
const VALUE_DIGITS_MAX: usize = 4;
const PARAM_DIGITS_MAX: usize = 8;
const CRC_DIGITS_MAX: usize = 2;

/// Reasons a line received from the wire is rejected
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line did not terminate within [`MAX_FRAME_LEN`] bytes
    Overflow,
    /// A byte that never appears in a well formed line
    UnexpectedByte(u8),
    /// The line has no `*<crc>` trailer
    MissingChecksum,
    ChecksumMismatch {
        expected: u8,
        actual: u8,
    },
    /// Unknown message or parameter letter
    InvalidCode(u8),
    /// Missing, malformed or too long hexadecimal value
    InvalidValue,
    /// Missing or surplus parameter token
    InvalidParam,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "line exceeds {MAX_FRAME_LEN} bytes"),
            Self::UnexpectedByte(b) => write!(f, "unexpected byte 0x{b:02x}"),
            Self::MissingChecksum => write!(f, "missing checksum"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: line says {expected:x}, payload is {actual:x}")
            }
            Self::InvalidCode(c) => write!(f, "invalid code 0x{c:02x}"),
            Self::InvalidValue => write!(f, "invalid value"),
            Self::InvalidParam => write!(f, "invalid parameter"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// A single encoded line
///
/// Uses a statically sized inline buffer. Writes past the capacity are truncated; no message this
/// crate encodes comes close to it.
#[derive(Clone)]
pub struct Frame {
    buffer: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; MAX_FRAME_LEN],
            len: 0,
        }
    }

    /// Builds a complete line from a payload, appending checksum and terminator
    pub fn sealed(payload: &str) -> Self {
        let mut frame = Frame::new();
        frame.extend(payload.as_bytes());
        frame.seal();
        frame
    }

    /// The encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// The encoded line as text, without the terminator
    pub fn as_str(&self) -> &str {
        let line = self.as_bytes();
        let line = line.strip_suffix(&[MESSAGE_TERMINATOR]).unwrap_or(line);
        core::str::from_utf8(line).unwrap_or("<binary>")
    }

    fn extend(&mut self, buf: &[u8]) {
        let area = &mut self.buffer[self.len..];
        let len = buf.len().min(area.len());
        area[..len].copy_from_slice(&buf[..len]);
        self.len += len;
    }

    /// Appends formatted text
    ///
    /// Writing to a `Frame` cannot fail, text beyond the capacity is truncated.
    fn append(&mut self, args: fmt::Arguments<'_>) {
        let _ = self.write_fmt(args);
    }

    fn seal(&mut self) {
        let crc = crc8(self.as_bytes());
        self.append(format_args!("*{crc:x}\n"));
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Frame {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extend(s.as_bytes());
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?})", self.as_str())
    }
}

/// Renders a request as a complete line
pub fn encode_request(msg: &RequestMsg) -> Frame {
    let mut frame = Frame::new();
    frame.append(format_args!("{msg}"));
    frame.seal();
    frame
}

/// Renders a response as a complete line
///
/// Used by the device side of the link.
pub fn encode_response(msg: &ResponseMsg) -> Frame {
    let mut frame = Frame::new();
    frame.append(format_args!("{msg}"));
    frame.seal();
    frame
}

/// Accumulates bytes of one line and verifies its checksum
#[derive(Clone)]
struct LineDecoder {
    line: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl LineDecoder {
    const fn new() -> Self {
        Self {
            line: [0u8; MAX_FRAME_LEN],
            len: 0,
        }
    }

    fn reset(&mut self) {
        self.len = 0;
    }

    /// Feeds one byte, returning the verified payload once the terminator arrives
    fn push(&mut self, b: u8) -> Result<Option<&[u8]>, DecodeError> {
        if b == MESSAGE_TERMINATOR {
            let len = self.len;
            self.len = 0;
            return verify_line(&self.line[..len]).map(Some);
        }
        if !(b.is_ascii_alphanumeric() || b == MESSAGE_SEPARATOR || b == MESSAGE_CRC_MARK) {
            self.len = 0;
            return Err(DecodeError::UnexpectedByte(b));
        }
        // Leave room for the terminator
        if self.len + 1 >= MAX_FRAME_LEN {
            self.len = 0;
            return Err(DecodeError::Overflow);
        }
        self.line[self.len] = b;
        self.len += 1;
        Ok(None)
    }
}

fn verify_line(line: &[u8]) -> Result<&[u8], DecodeError> {
    let mark = line
        .iter()
        .rposition(|b| *b == MESSAGE_CRC_MARK)
        .ok_or(DecodeError::MissingChecksum)?;
    let (payload, trailer) = (&line[..mark], &line[mark + 1..]);
    let expected =
        parse_hex(trailer, 1, CRC_DIGITS_MAX).map_err(|_| DecodeError::MissingChecksum)?;
    let actual = crc8(payload);
    if expected != u32::from(actual) {
        return Err(DecodeError::ChecksumMismatch {
            expected: expected as u8,
            actual,
        });
    }
    Ok(payload)
}

fn parse_hex(digits: &[u8], min: usize, max: usize) -> Result<u32, DecodeError> {
    if digits.len() < min || digits.len() > max {
        return Err(DecodeError::InvalidValue);
    }
    digits.iter().try_fold(0u32, |acc, d| {
        let v = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => d - b'a' + 10,
            _ => return Err(DecodeError::InvalidValue),
        };
        Ok(acc << 4 | u32::from(v))
    })
}

/// Splits `<code><hex>` into its parts
fn parse_head(token: &[u8]) -> Result<(RequestCode, u16), DecodeError> {
    let (&code, digits) = token.split_first().ok_or(DecodeError::InvalidParam)?;
    let code = RequestCode::try_from(code).map_err(DecodeError::InvalidCode)?;
    let value = parse_hex(digits, 1, VALUE_DIGITS_MAX)?;
    Ok((code, value as u16))
}

fn parse_response(payload: &[u8]) -> Result<ResponseMsg, DecodeError> {
    let mut tokens = payload.split(|b| *b == MESSAGE_SEPARATOR);
    let head = tokens.next().ok_or(DecodeError::InvalidParam)?;
    let param = tokens.next().ok_or(DecodeError::InvalidParam)?;
    if tokens.next().is_some() {
        return Err(DecodeError::InvalidParam);
    }

    let (code, value) = parse_head(head)?;
    let (&p, digits) = param.split_first().ok_or(DecodeError::InvalidParam)?;
    let param = ParamCode::try_from(p).map_err(DecodeError::InvalidCode)?;
    let param_value = parse_hex(digits, 0, PARAM_DIGITS_MAX)?;
    Ok(ResponseMsg {
        code,
        value,
        param,
        param_value,
    })
}

fn parse_request(payload: &[u8]) -> Result<RequestMsg, DecodeError> {
    let mut tokens = payload.split(|b| *b == MESSAGE_SEPARATOR);
    let head = tokens.next().ok_or(DecodeError::InvalidParam)?;
    let (code, value) = parse_head(head)?;
    let value2 = match (code, tokens.next()) {
        (RequestCode::Write, Some(v)) => Some(parse_hex(v, 1, VALUE_DIGITS_MAX)? as u16),
        (RequestCode::Write, None) => return Err(DecodeError::InvalidParam),
        (_, Some(_)) => return Err(DecodeError::InvalidParam),
        (_, None) => None,
    };
    if tokens.next().is_some() {
        return Err(DecodeError::InvalidParam);
    }
    Ok(RequestMsg {
        code,
        value,
        value2,
    })
}

/// Incremental decoder for responses arriving from the MMU
#[derive(Clone)]
pub struct ResponseDecoder {
    line: LineDecoder,
}

impl ResponseDecoder {
    pub const fn new() -> Self {
        Self {
            line: LineDecoder::new(),
        }
    }

    /// Feeds one received byte
    ///
    /// Returns `Ok(None)` while the line is incomplete. After a completed message or an error the
    /// decoder starts over with the next byte.
    pub fn decode_byte(&mut self, b: u8) -> Result<Option<ResponseMsg>, DecodeError> {
        match self.line.push(b)? {
            Some(payload) => parse_response(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Drops a partially accumulated line
    pub fn reset(&mut self) {
        self.line.reset();
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental decoder for requests, the device side of the link
#[derive(Clone)]
pub struct RequestDecoder {
    line: LineDecoder,
}

impl RequestDecoder {
    pub const fn new() -> Self {
        Self {
            line: LineDecoder::new(),
        }
    }

    /// Feeds one received byte, see [`ResponseDecoder::decode_byte`]
    pub fn decode_byte(&mut self, b: u8) -> Result<Option<RequestMsg>, DecodeError> {
        match self.line.push(b)? {
            Some(payload) => parse_request(payload).map(Some),
            None => Ok(None),
        }
    }

    pub fn reset(&mut self) {
        self.line.reset();
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(
        decoder: &mut ResponseDecoder,
        bytes: &[u8],
    ) -> Vec<Result<ResponseMsg, DecodeError>> {
        let mut out = Vec::new();
        for b in bytes {
            match decoder.decode_byte(*b) {
                Ok(None) => {}
                Ok(Some(msg)) => out.push(Ok(msg)),
                Err(e) => out.push(Err(e)),
            }
        }
        out
    }

    #[test]
    fn encodes_requests() {
        let frame = encode_request(&RequestMsg::new(RequestCode::Version, 0));
        assert_eq!(frame.as_bytes(), b"S0*d2\n");
        let frame = encode_request(&RequestMsg::new(RequestCode::Query, 0));
        assert_eq!(frame.as_bytes(), b"Q0*8\n");
        let frame = encode_request(&RequestMsg::write(0x0b, 30));
        assert_eq!(frame.as_bytes(), b"Wb 1e*c9\n");
        let frame = encode_request(&RequestMsg::new(RequestCode::FilamentSensor, 0));
        assert_eq!(frame.as_str(), "f0*f5");
    }

    #[test]
    fn sealed_matches_encoder() {
        let frame = Frame::sealed("W9 a");
        assert_eq!(frame.as_bytes(), b"W9 a*26\n");
        assert_eq!(
            frame.as_bytes(),
            encode_request(&RequestMsg::write(9, 10)).as_bytes()
        );
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let frame = Frame::sealed(&"W".repeat(MAX_FRAME_LEN + 8));
        assert_eq!(frame.as_bytes().len(), MAX_FRAME_LEN);
        assert!(frame.as_bytes().iter().all(|b| *b == b'W'));
    }

    #[test]
    fn decodes_response_variants() {
        let mut decoder = ResponseDecoder::new();
        let cases: &[(&str, RequestCode, u16, ParamCode, u32)] = &[
            ("S0 A3", RequestCode::Version, 0, ParamCode::Accepted, 3),
            ("S1 Af", RequestCode::Version, 1, ParamCode::Accepted, 0xf),
            ("T1 A", RequestCode::Tool, 1, ParamCode::Accepted, 0),
            ("T0 F", RequestCode::Tool, 0, ParamCode::Finished, 0),
            ("T0 P6", RequestCode::Tool, 0, ParamCode::Processing, 6),
            ("T1 E32771", RequestCode::Tool, 1, ParamCode::Error, 0x32771),
            ("T0 R", RequestCode::Tool, 0, ParamCode::Rejected, 0),
            ("X0 B2", RequestCode::Reset, 0, ParamCode::Button, 2),
            ("R1b A5", RequestCode::Read, 0x1b, ParamCode::Accepted, 5),
            ("f0 A", RequestCode::FilamentSensor, 0, ParamCode::Accepted, 0),
        ];
        for (text, code, value, param, param_value) in cases {
            let got = decode_all(&mut decoder, Frame::sealed(text).as_bytes());
            assert_eq!(
                got,
                vec![Ok(ResponseMsg {
                    code: *code,
                    value: *value,
                    param: *param,
                    param_value: *param_value,
                })],
                "decoding {text}"
            );
        }
    }

    #[test]
    fn response_encoding_is_self_consistent() {
        let mut decoder = ResponseDecoder::new();
        for code in [
            RequestCode::Tool,
            RequestCode::Load,
            RequestCode::Unload,
            RequestCode::Eject,
            RequestCode::Cut,
            RequestCode::Home,
            RequestCode::Reset,
            RequestCode::Button,
            RequestCode::Read,
            RequestCode::Write,
            RequestCode::Version,
            RequestCode::Query,
            RequestCode::FilamentSensor,
        ] {
            let rsp = ResponseMsg::new(RequestMsg::new(code, 4), ParamCode::Finished, 0x1234);
            let got = decode_all(&mut decoder, encode_response(&rsp).as_bytes());
            assert_eq!(got, vec![Ok(rsp)]);
        }
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut decoder = ResponseDecoder::new();
        let got = decode_all(&mut decoder, b"S0 A3*ed\n");
        assert_eq!(
            got,
            vec![Err(DecodeError::ChecksumMismatch {
                expected: 0xed,
                actual: 0xec
            })]
        );
        // The decoder resynchronizes on the next line
        let got = decode_all(&mut decoder, b"S0 A3*ec\n");
        assert_eq!(got.len(), 1);
        assert!(got[0].is_ok());
    }

    #[test]
    fn malformed_lines() {
        let mut decoder = ResponseDecoder::new();
        assert_eq!(
            decode_all(&mut decoder, b"DeadBeef\n"),
            vec![Err(DecodeError::MissingChecksum)]
        );
        // Valid checksum, no parameter token
        let frame = Frame::sealed("T4 25");
        assert_eq!(
            decode_all(&mut decoder, frame.as_bytes()),
            vec![Err(DecodeError::InvalidCode(b'2'))]
        );
        let frame = Frame::sealed("T4");
        assert_eq!(
            decode_all(&mut decoder, frame.as_bytes()),
            vec![Err(DecodeError::InvalidParam)]
        );
        let frame = Frame::sealed("Z4 A");
        assert_eq!(
            decode_all(&mut decoder, frame.as_bytes()),
            vec![Err(DecodeError::InvalidCode(b'Z'))]
        );
        let frame = Frame::sealed("T4 A123456789");
        assert_eq!(
            decode_all(&mut decoder, frame.as_bytes()),
            vec![Err(DecodeError::InvalidValue)]
        );
        assert_eq!(
            decode_all(&mut decoder, b"T0\rA\n"),
            vec![Err(DecodeError::UnexpectedByte(b'\r')), Err(DecodeError::MissingChecksum)]
        );
    }

    #[test]
    fn overlong_line_overflows() {
        let mut decoder = ResponseDecoder::new();
        let garbage = [b'a'; MAX_FRAME_LEN + 4];
        let got = decode_all(&mut decoder, &garbage);
        assert_eq!(got, vec![Err(DecodeError::Overflow)]);
    }

    #[test]
    fn reset_discards_partial_line() {
        let mut decoder = ResponseDecoder::new();
        assert_eq!(decode_all(&mut decoder, b"T0 P"), vec![]);
        decoder.reset();
        let got = decode_all(&mut decoder, Frame::sealed("S0 A3").as_bytes());
        assert_eq!(got.len(), 1);
        assert!(got[0].is_ok());
    }

    #[test]
    fn decodes_requests() {
        let mut decoder = RequestDecoder::new();
        let mut feed = |bytes: &[u8]| {
            let mut out = None;
            for b in bytes {
                if let Some(msg) = decoder.decode_byte(*b).unwrap() {
                    out = Some(msg);
                }
            }
            out
        };
        assert_eq!(
            feed(encode_request(&RequestMsg::write(0x14, 20)).as_bytes()),
            Some(RequestMsg::write(0x14, 20))
        );
        assert_eq!(
            feed(encode_request(&RequestMsg::new(RequestCode::Tool, 3)).as_bytes()),
            Some(RequestMsg::new(RequestCode::Tool, 3))
        );
    }

    #[test]
    fn request_write_without_value_is_rejected() {
        let mut decoder = RequestDecoder::new();
        let mut result = Ok(None);
        for b in Frame::sealed("W9").as_bytes() {
            result = decoder.decode_byte(*b);
        }
        assert_eq!(result, Err(DecodeError::InvalidParam));
    }
}
