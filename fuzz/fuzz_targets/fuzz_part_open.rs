#![no_main]
use libfuzzer_sys::fuzz_target;
use opcstream_rs::{
    Aes256BlockCipher, CompressionMethod, FormatVersion, PartStreamBuilder, SharedStream,
    StreamContext, VersionPair,
};
use std::io::Read;
use std::sync::Arc;

// Arbitrary bytes opened as a stored part must fail cleanly, never panic
fuzz_target!(|data: &[u8]| {
    let Some((&selector, body)) = data.split_first() else {
        return;
    };
    let ctx = StreamContext::default();
    let mut builder = PartStreamBuilder::new(&ctx);
    if selector & 1 != 0 {
        builder = builder.encrypted(Arc::new(Aes256BlockCipher::new(&[7u8; 32])));
    }
    if let Some(method) = CompressionMethod::from_u8((selector >> 1) & 3) {
        builder = builder.compressed_with(method);
    }
    if selector & 8 != 0 {
        builder = builder.versioned(FormatVersion::new("Fuzz.Feature", VersionPair::new(1, 0)));
    }

    let raw = SharedStream::memory(body.to_vec());
    let Ok(mut part) = builder.open(raw) else {
        return;
    };
    let mut sink = Vec::new();
    let _ = part.by_ref().take(1 << 20).read_to_end(&mut sink);
    let _ = part.close();
});
