//! Fuzz target for transfer header decoding.
//!
//! Decoding must never panic, and anything it accepts must re-encode to
//! a line that decodes to the same header.

#![no_main]

use file_distributor::protocol::TransferHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(header) = TransferHeader::decode(data) else {
        return;
    };
    assert!(header.size > 0);

    let again = TransferHeader::decode(&header.encode()).expect("re-encoded header must decode");
    assert_eq!(again, header);
});
