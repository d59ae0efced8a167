#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use trellis_proto::reliable::{Config, ReliableEndpoint};
use web_time::Instant;

// the endpoint must survive arbitrary inbound bytes without panicking
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let word = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let payload = &data[4..];
    let payload = if payload.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(payload))
    };

    let mut ep = ReliableEndpoint::new(Config::default());
    ep.unlock_transmission();
    ep.on_frame(Instant::now(), word, payload);
    ep.tick(Instant::now());
});
