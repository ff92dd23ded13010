//! Fuzz target for `Frame::decode`.
//!
//! Arbitrary bytes must produce `Ok` or `Err`, never a panic, an
//! oversize allocation, or a buffer over-read.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::{DEFAULT_MAX_FRAME_BYTES, Frame};

fuzz_target!(|data: &[u8]| {
    let _ = Frame::decode(data, None, DEFAULT_MAX_FRAME_BYTES);
});
