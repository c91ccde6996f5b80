#![no_main]

use libfuzzer_sys::fuzz_target;

mod utils;

fuzz_target!(|data: &[u8]| {
    let data = utils::capped(data);
    if let Ok(value) = nova_dwp::decode_value_bytes(data) {
        // Anything that decodes must re-encode into something decodable.
        let mut w = nova_dwp::DwpWriter::new();
        w.write_value(&value);
        nova_dwp::decode_value_bytes(&w.into_vec()).expect("re-encoded value decodes");
    }
});
