#![no_main]
use libfuzzer_sys::fuzz_target;
use zenheif_parse::DecodeConfig;

fuzz_target!(|data: &[u8]| {
    let config = DecodeConfig::default().with_max_depth(8).with_max_boxes(256);
    let _ = zenheif_parse::read_boxes_with_config(&mut &data[..], data.len() as u64, &config);
});
