//! Fuzz target for the daemon wire codec.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Decodes arbitrary bytes as a sequence of length-prefixed daemon
//! messages. Every successful decode must consume a non-empty prefix.

#![no_main]

use idelink_core::codec::decode_frame;
use idelink_core::protocol::DaemonMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((_, used))) = decode_frame::<DaemonMessage>(rest) {
        assert!(used > 0 && used <= rest.len());
        rest = &rest[used..];
    }
});
