//! Fuzz target: `LineDecoder::feed`
//!
//! Feeds arbitrary bytes in two arbitrary chunks and asserts the
//! decoder never panics and that a reset always recovers it.
//!
//! cargo fuzz run fuzz_line_decoder

#![no_main]

use carelink::shell::LineDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = LineDecoder::new();
    let cut = data.len() / 2;

    let first = decoder.feed(&data[..cut]);
    if first.is_err() {
        decoder.reset();
    }
    let _ = decoder.feed(&data[cut..]);

    // After a reset the decoder accepts a clean line again.
    decoder.reset();
    let lines = decoder.feed(b"3:ok\n").expect("clean line after reset");
    assert_eq!(lines, vec!["3:ok".to_string()]);
});
