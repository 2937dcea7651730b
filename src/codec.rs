//! Wire format for the five TFTP message kinds (RFC 1350).
//!
//! Parsing returns owned/borrowed values rather than offsets into the
//! receive buffer, and building writes into a caller-supplied scratch
//! buffer instead of allocating a fresh one per datagram.

use std::fmt;

use bytes::Buf;

/// Maximum size of any TFTP datagram this server sends or accepts:
/// 4 byte header + 512 byte data block.
pub const MAX_MSG_LEN: usize = 516;
/// Maximum bytes of file data carried by one DATA packet.
pub const MAX_DATA_LEN: usize = 512;
pub const MAX_FILENAME_LEN: usize = 256;
pub const MAX_MODE_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }
}

/// RFC 1350 transfer mode. Only `Octet` is actually wired into the data
/// path; `Netascii` is parsed and stored but never triggers translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
    Mail,
}

impl TransferMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(TransferMode::Netascii),
            "octet" => Some(TransferMode::Octet),
            "mail" => Some(TransferMode::Mail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

/// Canonical TFTP error codes (RFC 1350 section 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Canonical message text for every code except `Undefined`, where
    /// the caller supplies its own text.
    pub fn canonical_text(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "illegal tftp operation",
            ErrorCode::UnknownTransferId => "unknown transfer id",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
        }
    }
}

/// A parsed TFTP datagram. Borrows `data`/`msg` from the caller's receive
/// buffer; `filename`/`mode` are copied out since request messages are
/// tiny and short-lived regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    Rrq { filename: String, mode: TransferMode },
    Wrq { filename: String, mode: TransferMode },
    Data { block: u16, data: &'a [u8] },
    Ack { block: u16 },
    Error { code: u16, msg: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooShort,
    UnknownOpcode,
    BadRequest,
    UnknownMode,
    BadErrorMessage,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseError::TooShort => "datagram too short",
            ParseError::UnknownOpcode => "unknown opcode",
            ParseError::BadRequest => "malformed request",
            ParseError::UnknownMode => "unknown transfer mode",
            ParseError::BadErrorMessage => "malformed error message",
        };
        f.write_str(s)
    }
}

/// Reads the big-endian `u16` at the front of `buf` via [`Buf`], the way
/// the rest of this lineage reads fixed-width wire fields out of byte
/// slices rather than hand-rolling `from_be_bytes`.
fn read_u16(buf: &[u8]) -> u16 {
    let mut cursor = buf;
    cursor.get_u16()
}

/// Reads a NUL-terminated string starting at `buf[0]`, bounded to
/// `max_len` bytes including the terminator. Returns the string and the
/// number of bytes consumed (including the NUL).
fn read_cstr(buf: &[u8], max_len: usize) -> Option<(&str, usize)> {
    let bound = buf.len().min(max_len);
    let nul = buf[..bound].iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&buf[..nul]).ok()?;
    Some((s, nul + 1))
}

/// Parses a raw datagram. `buf` must be at least 2 bytes (callers should
/// simply drop shorter reads; a valid reactor never hands this fewer).
pub fn parse(buf: &[u8]) -> Result<Message<'_>, ParseError> {
    if buf.len() < 2 {
        return Err(ParseError::TooShort);
    }
    let opcode = read_u16(buf);
    match Opcode::from_u16(opcode) {
        Some(Opcode::Rrq) | Some(Opcode::Wrq) => {
            let rest = &buf[2..];
            let (filename, consumed) =
                read_cstr(rest, MAX_FILENAME_LEN).ok_or(ParseError::BadRequest)?;
            let rest = &rest[consumed..];
            let (mode_str, _) = read_cstr(rest, MAX_MODE_LEN).ok_or(ParseError::BadRequest)?;
            let mode = TransferMode::parse(mode_str).ok_or(ParseError::UnknownMode)?;
            if filename.is_empty() {
                return Err(ParseError::BadRequest);
            }
            let filename = filename.to_string();
            if opcode == Opcode::Rrq as u16 {
                Ok(Message::Rrq { filename, mode })
            } else {
                Ok(Message::Wrq { filename, mode })
            }
        }
        Some(Opcode::Data) => {
            if buf.len() < 4 || buf.len() > MAX_MSG_LEN {
                return Err(ParseError::TooShort);
            }
            let block = read_u16(&buf[2..4]);
            Ok(Message::Data { block, data: &buf[4..] })
        }
        Some(Opcode::Ack) => {
            if buf.len() != 4 {
                return Err(ParseError::TooShort);
            }
            Ok(Message::Ack { block: read_u16(&buf[2..4]) })
        }
        Some(Opcode::Error) => {
            if buf.len() < 5 {
                return Err(ParseError::TooShort);
            }
            let code = read_u16(&buf[2..4]);
            let rest = &buf[4..];
            let (_text, consumed) =
                read_cstr(rest, MAX_FILENAME_LEN).ok_or(ParseError::BadErrorMessage)?;
            Ok(Message::Error { code, msg: &rest[..consumed - 1] })
        }
        None => Err(ParseError::UnknownOpcode),
    }
}

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Serialises an RRQ into `out`, clearing it first. `out`'s capacity
/// should be at least [`MAX_MSG_LEN`].
pub fn build_rrq(out: &mut Vec<u8>, filename: &str, mode: TransferMode) {
    build_request(out, Opcode::Rrq, filename, mode)
}

pub fn build_wrq(out: &mut Vec<u8>, filename: &str, mode: TransferMode) {
    build_request(out, Opcode::Wrq, filename, mode)
}

fn build_request(out: &mut Vec<u8>, op: Opcode, filename: &str, mode: TransferMode) {
    out.clear();
    out.extend_from_slice(&(op as u16).to_be_bytes());
    push_cstr(out, filename);
    push_cstr(out, mode.as_str());
}

pub fn build_data(out: &mut Vec<u8>, block: u16, data: &[u8]) {
    debug_assert!(data.len() <= MAX_DATA_LEN);
    out.clear();
    out.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
    out.extend_from_slice(&block.to_be_bytes());
    out.extend_from_slice(data);
}

pub fn build_ack(out: &mut Vec<u8>, block: u16) {
    out.clear();
    out.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
    out.extend_from_slice(&block.to_be_bytes());
}

/// Builds an ERROR datagram. For every code but `Undefined` the
/// canonical text is used and `text` is ignored.
pub fn build_error(out: &mut Vec<u8>, code: ErrorCode, text: &str) {
    out.clear();
    out.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
    out.extend_from_slice(&(code as u16).to_be_bytes());
    let msg = match code {
        ErrorCode::Undefined => text,
        other => other.canonical_text(),
    };
    push_cstr(out, msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_rrq() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_rrq(&mut buf, "greet.txt", TransferMode::Octet);
        match parse(&buf).unwrap() {
            Message::Rrq { filename, mode } => {
                assert_eq!(filename, "greet.txt");
                assert_eq!(mode, TransferMode::Octet);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trip_wrq() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_wrq(&mut buf, "new.txt", TransferMode::Octet);
        match parse(&buf).unwrap() {
            Message::Wrq { filename, mode } => {
                assert_eq!(filename, "new.txt");
                assert_eq!(mode, TransferMode::Octet);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trip_data() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        let payload = vec![7u8; 512];
        build_data(&mut buf, 42, &payload);
        match parse(&buf).unwrap() {
            Message::Data { block, data } => {
                assert_eq!(block, 42);
                assert_eq!(data, &payload[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trip_empty_data_means_eof() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_data(&mut buf, 2, &[]);
        match parse(&buf).unwrap() {
            Message::Data { block, data } => {
                assert_eq!(block, 2);
                assert!(data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn round_trip_ack() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_ack(&mut buf, 65535);
        assert_eq!(parse(&buf).unwrap(), Message::Ack { block: 65535 });
    }

    #[test]
    fn round_trip_error() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_error(&mut buf, ErrorCode::FileNotFound, "ignored");
        match parse(&buf).unwrap() {
            Message::Error { code, msg } => {
                assert_eq!(code, ErrorCode::FileNotFound as u16);
                assert_eq!(msg, b"file not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_undefined_uses_caller_text() {
        let mut buf = Vec::with_capacity(MAX_MSG_LEN);
        build_error(&mut buf, ErrorCode::Undefined, "server error");
        match parse(&buf).unwrap() {
            Message::Error { code, msg } => {
                assert_eq!(code, 0);
                assert_eq!(msg, b"server error");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_distinct_from_malformed() {
        let buf = [0u8, 9, 1, 2];
        assert_eq!(parse(&buf).unwrap_err(), ParseError::UnknownOpcode);
    }

    #[test]
    fn ack_wrong_length_is_rejected() {
        let buf = [0u8, 4, 0, 1, 0];
        assert_eq!(parse(&buf).unwrap_err(), ParseError::TooShort);
    }

    #[test]
    fn request_missing_mode_is_rejected() {
        let mut buf = vec![0u8, 1];
        buf.extend_from_slice(b"file.txt\0");
        assert_eq!(parse(&buf).unwrap_err(), ParseError::BadRequest);
    }

    #[test]
    fn request_empty_filename_is_rejected() {
        let mut buf = vec![0u8, 1, 0];
        buf.extend_from_slice(b"octet\0");
        assert_eq!(parse(&buf).unwrap_err(), ParseError::BadRequest);
    }
}
