//! Fuzz envelope decoding with both codecs.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_proto::{Codec, Envelope};

fuzz_target!(|data: &[u8]| {
    for codec in [Codec::Cbor, Codec::Json] {
        if let Ok(envelope) = codec.decode::<Envelope<(u32, String)>>(data) {
            let encoded = codec.encode(&envelope).expect("re-encode decoded envelope");
            let again: Envelope<(u32, String)> = codec.decode(&encoded).expect("decode re-encoded envelope");
            assert_eq!(again, envelope);
        }
    }
});
