//! Fuzz target: `parse_ad_blocks`
//!
//! Drives arbitrary byte sequences through the advertisement parser
//! and asserts it never panics, never yields more blocks than fit an
//! advertisement, and keeps every value slice inside the input.
//!
//! cargo fuzz run fuzz_adv_parser

#![no_main]

use carelink::advert::parse_ad_blocks;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let blocks = parse_ad_blocks(data);
    assert!(blocks.len() <= 16, "more blocks than an advertisement holds");

    if let Some(value) = blocks.manufacturer_data() {
        assert!(value.len() <= data.len());
    }
    if let Some(name) = blocks.local_name() {
        assert!(name.len() <= data.len());
    }
});
