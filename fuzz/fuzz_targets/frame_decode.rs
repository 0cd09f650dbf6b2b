//! Fuzz the length-prefixed frame reader.
//!
//! Arbitrary bytes arriving in arbitrary chunk sizes must never panic, and
//! every frame handed out must respect the size limit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_proto::{FrameReader, MAX_FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);

    let mut reader = FrameReader::with_capacity(64);
    for piece in stream.chunks(chunk) {
        reader.extend(piece);
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => assert!(frame.len() <= MAX_FRAME_SIZE),
                Ok(None) => break,
                // An oversized prefix poisons the stream.
                Err(_) => return,
            }
        }
    }
});
