//! Full stack tests: versioned over compressed over encrypted over a container part

use opcstream_rs::{
    generate_key, Aes256BlockCipher, CompressionMethod, FormatVersion, MemoryContainer,
    PartContainer, PartStreamBuilder, SparseConfig, StreamConfig, StreamContext, VersionPair,
    LENGTH_PREFIX_SIZE,
};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

const PART: &str = "/customXml/item1.xml";

fn full_builder(ctx: &StreamContext, key: &[u8; 32], method: CompressionMethod) -> PartStreamBuilder {
    PartStreamBuilder::new(ctx)
        .encrypted(Arc::new(Aes256BlockCipher::new(key)))
        .compressed_with(method)
        .versioned(FormatVersion::new("Opc.CustomXml", VersionPair::new(1, 0)))
}

fn document(len: usize) -> Vec<u8> {
    b"<item id=\"n\">value</item>"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

fn read_part(container: &mut MemoryContainer, builder: &PartStreamBuilder) -> Vec<u8> {
    let mut part = builder.open(container.open_part(PART).unwrap()).unwrap();
    let mut out = Vec::new();
    part.read_to_end(&mut out).unwrap();
    part.close().unwrap();
    out
}

#[test]
fn test_full_stack_round_trip() {
    let ctx = StreamContext::default();
    let key = generate_key();
    let data = document(50_000);

    for method in [
        CompressionMethod::Deflate,
        CompressionMethod::Zstd,
        CompressionMethod::Lz4,
    ] {
        let mut container = MemoryContainer::new();
        let builder = full_builder(&ctx, &key, method);

        let raw = container.create_part(PART, "application/xml").unwrap();
        let mut part = builder.create(raw).unwrap();
        part.write_all(&data).unwrap();
        part.close().unwrap();

        let stored = container.raw_bytes(PART).unwrap();
        let prefix = u64::from_le_bytes(stored[..8].try_into().unwrap());
        assert!(prefix < data.len() as u64, "{} payload not compressed", method);
        assert_eq!(stored.len() as u64, LENGTH_PREFIX_SIZE + prefix.next_multiple_of(16));
        assert!(!stored.windows(7).any(|w| w == b"<item i"));

        assert_eq!(read_part(&mut container, &builder), data, "{}", method);
    }
}

#[test]
fn test_random_edit_through_full_stack() {
    let ctx = StreamContext::default();
    let key = generate_key();
    let builder = full_builder(&ctx, &key, CompressionMethod::Deflate);
    let mut container = MemoryContainer::new();
    let data = document(4096);

    let raw = container.create_part(PART, "application/xml").unwrap();
    let mut part = builder.create(raw).unwrap();
    part.write_all(&data).unwrap();
    part.close().unwrap();

    let mut part = builder.open(container.open_part(PART).unwrap()).unwrap();
    part.seek(SeekFrom::Start(5)).unwrap();
    part.write_all(b"EDIT").unwrap();
    part.seek(SeekFrom::End(0)).unwrap();
    part.write_all(b"<tail/>").unwrap();
    part.close().unwrap();

    let mut expected = data.clone();
    expected[5..9].copy_from_slice(b"EDIT");
    expected.extend_from_slice(b"<tail/>");
    assert_eq!(read_part(&mut container, &builder), expected);
}

#[test]
fn test_truncate_and_empty_part() {
    let ctx = StreamContext::default();
    let key = generate_key();
    let builder = full_builder(&ctx, &key, CompressionMethod::Zstd);
    let mut container = MemoryContainer::new();

    let raw = container.create_part(PART, "application/xml").unwrap();
    let mut part = builder.create(raw).unwrap();
    part.write_all(&document(1000)).unwrap();
    part.set_length(10).unwrap();
    assert_eq!(part.length().unwrap(), 10);
    part.close().unwrap();
    assert_eq!(read_part(&mut container, &builder), document(10));

    // A created part that never gets written still decodes as empty
    let raw = container.create_part("/empty", "text/plain").unwrap();
    let mut part = builder.create(raw).unwrap();
    part.close().unwrap();
    let mut part = builder.open(container.open_part("/empty").unwrap()).unwrap();
    let mut out = Vec::new();
    part.read_to_end(&mut out).unwrap();
    assert!(out.is_empty());
    part.close().unwrap();
}

#[test]
fn test_spilling_stack_with_small_caches() {
    let config = StreamConfig::from_toml_str(
        r#"
        [sparse]
        low_water_mark = 512
        high_water_mark = 2048

        [compression]
        method = "lz4"
        read_skip_threshold = 16

        [encryption]
        cache_flush_threshold = 1024
        "#,
    )
    .unwrap();
    assert_eq!(config.sparse, SparseConfig::with_water_marks(512, 2048));
    let ctx = StreamContext::new(config);
    let key = generate_key();
    let builder = PartStreamBuilder::new(&ctx)
        .encrypted(Arc::new(Aes256BlockCipher::new(&key)))
        .compressed_with(ctx.config.compression.method);
    let mut container = MemoryContainer::new();
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 13) as u8).collect();

    let raw = container.create_part(PART, "application/octet-stream").unwrap();
    let mut part = builder.create(raw).unwrap();
    part.write_all(&data).unwrap();
    // Rewrite a span near the start to force emulation over a spilled buffer
    part.seek(SeekFrom::Start(100)).unwrap();
    part.write_all(&[0xEE; 50]).unwrap();
    part.close().unwrap();

    let mut expected = data;
    expected[100..150].fill(0xEE);
    assert_eq!(read_part(&mut container, &builder), expected);
}
