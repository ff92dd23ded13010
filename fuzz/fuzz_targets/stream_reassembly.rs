//! Fuzz target for the streaming assembler.
//!
//! Splits arbitrary input into arbitrary chunk sizes and feeds it
//! through; the assembler must never panic and must stop cleanly on the
//! first wire violation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::FrameAssembler;

fuzz_target!(|input: (u8, Vec<u8>)| {
    let (chunk_size, data) = input;
    let chunk_size = usize::from(chunk_size).max(1);

    let mut assembler = FrameAssembler::new(1 << 20, None);
    for chunk in data.chunks(chunk_size) {
        if assembler.feed(chunk).is_err() {
            break;
        }
    }
    let _ = assembler.finish();
});
