#![no_main]

use libfuzzer_sys::fuzz_target;
use nova_dwp::{events::decode_event_set, VersionInfo};

mod utils;

fuzz_target!(|data: &[u8]| {
    let data = utils::capped(data);
    let Some((&minor, payload)) = data.split_first() else {
        return;
    };
    let _ = decode_event_set(payload, VersionInfo::new(2, u32::from(minor % 64)));
});
