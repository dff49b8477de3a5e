//! Frame splitting over arbitrary byte streams.
//!
//! Feeds the input through a [`FrameDecoder`] in one piece and checks that
//! every body it returns respects the length limit and that the decoder
//! never consumes more than it was given.

#![no_main]

use bytes::BytesMut;
use elvin_proto::FrameDecoder;
use libfuzzer_sys::fuzz_target;

/// Small limit so oversized declarations are common.
const MAX_LEN: usize = 4096;

fuzz_target!(|data: &[u8]| {
    let decoder = FrameDecoder::new(MAX_LEN);
    let mut buf = BytesMut::from(data);
    let mut consumed = 0;

    loop {
        match decoder.decode(&mut buf) {
            Ok(Some(body)) => {
                assert!(body.len() <= MAX_LEN);
                consumed += 4 + body.len();
                assert!(consumed <= data.len());
            },
            Ok(None) | Err(_) => break,
        }
    }
});
