//! Packet body decoding.
//!
//! Arbitrary bodies must decode or fail cleanly. A body that decodes must
//! re-encode to bytes that decode to the same encoding again.

#![no_main]

use elvin_proto::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = Packet::decode(data) else {
        return;
    };
    let encoded = packet.encode();
    let reparsed = Packet::decode(&encoded).expect("re-encoded packet decodes");
    assert_eq!(reparsed.encode(), encoded);
});
