//! Fuzz target for target reply parsing.
//!
//! Handshake and trailer parsing must never panic on arbitrary replies.

#![no_main]

use file_distributor::protocol::{parse_trailer, HandshakeReply};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(reply) = HandshakeReply::parse(data) {
        assert_eq!(HandshakeReply::parse(reply.as_bytes()).ok(), Some(reply));
    }
    let _ = parse_trailer(data);
});
