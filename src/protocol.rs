// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire codec for the target-server protocol.
//!
//! ASCII control lines terminated by `\r\n`:
//!
//! ```text
//! keepalive   PING\r\n                                  → any ≥6-byte reply
//! header      {name}@{size}@{checksum}@{relative}\r\n  → ALL_SAME\r\n | CONTINUE\r\n
//! body        exactly `size` raw bytes
//! trailer                                              → OK\r\n
//! ```
//!
//! This module is pure: it never touches a socket. [`crate::link`] and
//! [`crate::transfer`] do the I/O.

use thiserror::Error;

/// Line terminator for every control line.
pub const LINE_END: &str = "\r\n";

/// Keepalive frame.
pub const PING: &[u8] = b"PING\r\n";

/// Minimum reply length for a keepalive PING.
pub const PING_REPLY_MIN_LEN: usize = 6;

/// Reply length for the header phase (`ALL_SAME\r\n` and `CONTINUE\r\n` are both 10 bytes).
pub const HANDSHAKE_REPLY_LEN: usize = 10;

/// Minimum reply length for the trailer (`OK\r\n`).
pub const TRAILER_MIN_LEN: usize = 4;

/// Field separator inside a header line.
pub const FIELD_SEPARATOR: char = '@';

const ALL_SAME: &str = "ALL_SAME";
const CONTINUE: &str = "CONTINUE";
const OK: &str = "OK";

/// Errors decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame is missing the line terminator")]
    Unterminated,
    #[error("header has {0} fields, expected 4")]
    FieldCount(usize),
    #[error("header size {0:?} is not a positive integer")]
    InvalidSize(String),
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(String),
}

/// The header line opening a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub name: String,
    pub size: u64,
    pub checksum: String,
    pub relative_path: String,
}

impl TransferHeader {
    /// Encode as `name@size@checksum@relative\r\n`.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "{}@{}@{}@{}{}",
            self.name, self.size, self.checksum, self.relative_path, LINE_END
        )
        .into_bytes()
    }

    /// Decode one header line (terminator required).
    ///
    /// The name and checksum never contain `@`; everything after the third
    /// separator belongs to the relative path.
    pub fn decode(line: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(line).map_err(|_| FrameError::NotUtf8)?;
        let body = text.strip_suffix(LINE_END).ok_or(FrameError::Unterminated)?;

        let fields: Vec<&str> = body.splitn(4, FIELD_SEPARATOR).collect();
        if fields.len() != 4 {
            return Err(FrameError::FieldCount(fields.len()));
        }

        let size = fields[1]
            .parse::<u64>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| FrameError::InvalidSize(fields[1].to_string()))?;

        Ok(Self {
            name: fields[0].to_string(),
            size,
            checksum: fields[2].to_string(),
            relative_path: fields[3].to_string(),
        })
    }
}

/// Target reply to the header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Target already holds byte-identical content; skip the body.
    AllSame,
    /// Target wants the body.
    Continue,
}

impl HandshakeReply {
    pub fn parse(reply: &[u8]) -> Result<Self, FrameError> {
        match trim_line(reply)? {
            ALL_SAME => Ok(Self::AllSame),
            CONTINUE => Ok(Self::Continue),
            other => Err(FrameError::UnexpectedReply(other.to_string())),
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::AllSame => b"ALL_SAME\r\n",
            Self::Continue => b"CONTINUE\r\n",
        }
    }
}

/// Check the trailing status line after a body.
pub fn parse_trailer(reply: &[u8]) -> Result<(), FrameError> {
    match trim_line(reply)? {
        OK => Ok(()),
        other => Err(FrameError::UnexpectedReply(other.to_string())),
    }
}

/// Trailer sent by a target after a complete body.
pub const TRAILER_OK: &[u8] = b"OK\r\n";

/// Strip any `\r`/`\n` from both ends of a reply.
fn trim_line(reply: &[u8]) -> Result<&str, FrameError> {
    let text = std::str::from_utf8(reply).map_err(|_| FrameError::NotUtf8)?;
    Ok(text.trim_matches(|c| c == '\r' || c == '\n'))
}

/// True if `field` can travel inside a header without breaking framing.
pub fn is_header_safe(field: &str) -> bool {
    !field.contains(FIELD_SEPARATOR) && !field.contains('\r') && !field.contains('\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> TransferHeader {
        TransferHeader {
            name: "logo.png".to_string(),
            size: 2048,
            checksum: "0cc175b9c0f1b6a831c399e269772661".to_string(),
            relative_path: "static/img".to_string(),
        }
    }

    #[test]
    fn test_encode_header_exact_bytes() {
        assert_eq!(
            header().encode(),
            b"logo.png@2048@0cc175b9c0f1b6a831c399e269772661@static/img\r\n".to_vec()
        );
    }

    #[test]
    fn test_encode_header_empty_relative_path() {
        let mut h = header();
        h.relative_path = String::new();
        assert!(h.encode().ends_with(b"@\r\n"));
        assert_eq!(TransferHeader::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn test_decode_relative_path_may_contain_separator() {
        let decoded = TransferHeader::decode(b"a.txt@3@abc@dir/x@y\r\n").unwrap();
        assert_eq!(decoded.name, "a.txt");
        assert_eq!(decoded.relative_path, "dir/x@y");
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(
            TransferHeader::decode(b"a.txt@3@abc@dir"),
            Err(FrameError::Unterminated)
        );
        assert_eq!(
            TransferHeader::decode(b"a.txt@3\r\n"),
            Err(FrameError::FieldCount(2))
        );
        assert!(matches!(
            TransferHeader::decode(b"a.txt@zero@abc@dir\r\n"),
            Err(FrameError::InvalidSize(_))
        ));
        assert!(matches!(
            TransferHeader::decode(b"a.txt@0@abc@dir\r\n"),
            Err(FrameError::InvalidSize(_))
        ));
        assert_eq!(
            TransferHeader::decode(&[0xff, 0xfe, b'\r', b'\n']),
            Err(FrameError::NotUtf8)
        );
    }

    #[test]
    fn test_handshake_reply_parse() {
        assert_eq!(HandshakeReply::parse(b"ALL_SAME\r\n"), Ok(HandshakeReply::AllSame));
        assert_eq!(HandshakeReply::parse(b"CONTINUE\r\n"), Ok(HandshakeReply::Continue));
        assert_eq!(
            HandshakeReply::parse(b"NOPE_NOPE\n"),
            Err(FrameError::UnexpectedReply("NOPE_NOPE".to_string()))
        );
    }

    #[test]
    fn test_handshake_reply_bytes_are_fixed_length() {
        assert_eq!(HandshakeReply::AllSame.as_bytes().len(), HANDSHAKE_REPLY_LEN);
        assert_eq!(HandshakeReply::Continue.as_bytes().len(), HANDSHAKE_REPLY_LEN);
    }

    #[test]
    fn test_trailer_parse() {
        assert!(parse_trailer(TRAILER_OK).is_ok());
        assert!(parse_trailer(b"OK").is_ok());
        assert!(parse_trailer(b"FAIL\r\n").is_err());
        assert_eq!(TRAILER_OK.len(), TRAILER_MIN_LEN);
    }

    #[test]
    fn test_ping_frame() {
        assert_eq!(PING, b"PING\r\n");
        assert_eq!(PING.len(), PING_REPLY_MIN_LEN);
    }

    #[test]
    fn test_is_header_safe() {
        assert!(is_header_safe("photo.jpg"));
        assert!(!is_header_safe("a@b.jpg"));
        assert!(!is_header_safe("evil\r\nPING"));
    }
}
