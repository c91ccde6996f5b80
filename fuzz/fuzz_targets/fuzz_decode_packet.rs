#![no_main]

use libfuzzer_sys::fuzz_target;

mod utils;

fuzz_target!(|data: &[u8]| {
    let data = utils::capped(data);
    if let Ok(packet) = nova_dwp::decode_packet_bytes(data) {
        // Replies carry a status; commands never do.
        if let nova_dwp::Packet::Reply { error_code, .. } = &packet {
            let _ = nova_dwp::DwpError::from_status(*error_code, None);
        }
    }
    if data.len() >= 4 {
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let _ = nova_dwp::validate_packet_length(length, 1024 * 1024);
    }
});
