//! Fuzz target for the force gauge stream decoder.
//!
//! Tests:
//! - Arbitrary bytes in arbitrary chunkings never panic
//! - Every decoded value is finite and below the overload threshold
//! - Once aligned, the record width is one of the known widths

#![no_main]

use arbitrary::Arbitrary;
use fdmeter::hardware::force_gauge::{StreamDecoder, WidthStrategy, KNOWN_RECORD_WIDTHS};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct DecodeInput {
    fixed_width: bool,
    chunks: Vec<Vec<u8>>,
}

const MAX_FORCE: f64 = 3.5;

fuzz_target!(|input: DecodeInput| {
    let strategy = if input.fixed_width {
        WidthStrategy::Fixed(6)
    } else {
        WidthStrategy::Measured
    };
    let mut decoder = StreamDecoder::new(strategy, MAX_FORCE);

    for chunk in input.chunks.iter().take(256) {
        match decoder.feed(chunk) {
            Ok(values) => {
                for value in values {
                    assert!(value.is_finite());
                    assert!(value.abs() < MAX_FORCE);
                }
            }
            // Overload: a real reader stops here, the decoder must stay usable
            Err(_) => decoder.reset(),
        }
        if let Some(width) = decoder.record_width() {
            assert!(KNOWN_RECORD_WIDTHS.contains(&width));
        }
    }
});
