#![no_main]

use libfuzzer_sys::fuzz_target;
use modscope::config::DecoderConfig;
use modscope::decoder;

fuzz_target!(|data: &[u8]| {
    // Any byte stream must decode without panicking; bad lines are counted
    if let Ok(timeline) = decoder::decode_reader(data, &DecoderConfig::default()) {
        let _ = timeline.to_json();
    }
});
