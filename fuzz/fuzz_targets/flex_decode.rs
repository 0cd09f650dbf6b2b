//! Fuzz the flex control byte and the open path.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use skein_core::transform::{FlexOptions, XorCipher};
use skein_proto::FrameFlags;

fuzz_target!(|data: &[u8]| {
    let split = FrameFlags::split_frame(data);

    let Ok(cipher) = XorCipher::new(*b"fuzz") else {
        return;
    };
    let options = FlexOptions::new(true, true).with_cipher(Arc::new(cipher));
    let opened = options.open(data);

    // Both paths agree on which control bytes are acceptable.
    assert_eq!(split.is_ok(), opened.is_ok());

    if let Ok(body) = opened {
        let resealed = options.seal(&body).expect("seal after open");
        assert_eq!(options.open(&resealed).expect("reopen"), body);
    }
});
