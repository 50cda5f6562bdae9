#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(boxes) = zenheif_parse::read_boxes(&mut &data[..]) {
        for b in boxes.iter() {
            let _ = b.to_string();
        }
    }
});
