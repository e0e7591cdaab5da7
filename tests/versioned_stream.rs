//! Format version header checks through the public API

use opcstream_rs::{
    ErrorClass, FormatVersion, PackageError, PartStream, SharedStream, VersionPair,
    VersionedStream,
};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

type Raw = SharedStream<Cursor<Vec<u8>>>;

const FEATURE: &str = "Opc.Sample.Feature";

fn write_part(raw: &Raw, version: FormatVersion, payload: &[u8]) {
    let mut stream = VersionedStream::new(raw.clone(), version);
    stream.write_all(payload).unwrap();
    stream.close().unwrap();
}

#[test]
fn test_payload_offsets_exclude_header() {
    let raw = SharedStream::memory(Vec::new());
    let version = FormatVersion::new(FEATURE, VersionPair::new(1, 0));
    write_part(&raw, version.clone(), b"0123456789");

    let bytes = raw.to_vec();
    assert_eq!(bytes.len() as u64, version.byte_len() + 10);
    assert_eq!(&bytes[..version.byte_len() as usize], &version.to_bytes()[..]);

    let mut stream = VersionedStream::new(raw.clone(), version);
    assert_eq!(stream.length().unwrap(), 10);
    stream.seek(SeekFrom::Start(4)).unwrap();
    let mut four = [0u8; 4];
    stream.read_exact(&mut four).unwrap();
    assert_eq!(&four, b"4567");
    assert_eq!(stream.seek(SeekFrom::End(-1)).unwrap(), 9);
}

#[test]
fn test_newer_reader_requirement_blocks_reads() {
    let raw = SharedStream::memory(Vec::new());
    let file = FormatVersion::with_versions(
        FEATURE,
        VersionPair::new(3, 0),
        VersionPair::new(3, 0),
        VersionPair::new(3, 0),
    );
    write_part(&raw, file, b"future");

    let mut stream = VersionedStream::new(raw, FormatVersion::new(FEATURE, VersionPair::new(2, 5)));
    let mut buf = [0u8; 6];
    let err = PackageError::from(stream.read(&mut buf).unwrap_err());
    assert!(matches!(
        err,
        PackageError::VersionIncompatible { action: "read", .. }
    ));
    assert_eq!(err.class(), ErrorClass::CapabilityMismatch);
}

#[test]
fn test_readable_but_not_updatable() {
    let raw = SharedStream::memory(Vec::new());
    let file = FormatVersion::with_versions(
        FEATURE,
        VersionPair::new(1, 0),
        VersionPair::new(2, 0),
        VersionPair::new(2, 0),
    );
    write_part(&raw, file, b"keep");

    let code = FormatVersion::new(FEATURE, VersionPair::new(1, 4));
    let mut stream = VersionedStream::new(raw.clone(), code);
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert_eq!(out, "keep");

    let err = PackageError::from(stream.write(b"x").unwrap_err());
    assert!(matches!(
        err,
        PackageError::VersionIncompatible { action: "update", .. }
    ));
}

#[test]
fn test_write_refreshes_writer_version() {
    let raw = SharedStream::memory(Vec::new());
    write_part(
        &raw,
        FormatVersion::new("opc.sample.FEATURE", VersionPair::new(1, 0)),
        b"v1",
    );

    let code = FormatVersion::with_versions(
        FEATURE,
        VersionPair::new(1, 0),
        VersionPair::new(1, 0),
        VersionPair::new(1, 7),
    );
    let mut stream = VersionedStream::new(raw.clone(), code);
    stream.seek(SeekFrom::End(0)).unwrap();
    stream.write_all(b"+v1.7").unwrap();
    stream.close().unwrap();

    let parsed = FormatVersion::read_from(&mut raw.to_vec().as_slice()).unwrap();
    assert_eq!(parsed.writer, VersionPair::new(1, 7));
    assert_eq!(parsed.reader, VersionPair::new(1, 0));
    assert_eq!(parsed.feature_id, "opc.sample.FEATURE");

    let mut stream = VersionedStream::new(raw, FormatVersion::new(FEATURE, VersionPair::new(1, 0)));
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert_eq!(out, "v1+v1.7");
}

#[test]
fn test_feature_mismatch_is_format_error() {
    let raw = SharedStream::memory(Vec::new());
    write_part(&raw, FormatVersion::new("Other.Feature", VersionPair::new(1, 0)), b"x");

    let stream = VersionedStream::new(raw, FormatVersion::new(FEATURE, VersionPair::new(1, 0)));
    let err = stream.file_version().unwrap_err();
    assert!(matches!(err, PackageError::FeatureMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::CorruptData);
}

#[test]
fn test_clones_share_header_state() {
    let raw = SharedStream::memory(Vec::new());
    let mut writer = VersionedStream::new(raw.clone(), FormatVersion::new(FEATURE, VersionPair::new(1, 0)));
    let mut reader = writer.clone();

    assert_eq!(writer.file_version().unwrap(), None);
    writer.write_all(b"shared").unwrap();
    assert_eq!(reader.position(), 0);

    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    assert_eq!(out, "shared");
    assert_eq!(
        reader.file_version().unwrap().map(|v| v.feature_id),
        Some(FEATURE.to_string())
    );
}

#[test]
fn test_garbage_header_is_corrupt() {
    let mut bytes = vec![0xFF; 4];
    bytes.extend_from_slice(b"random trailing data");
    let raw = SharedStream::memory(bytes);

    let stream = VersionedStream::new(raw, FormatVersion::new(FEATURE, VersionPair::new(1, 0)));
    assert!(matches!(
        stream.len(),
        Err(PackageError::CorruptData(_))
    ));
}
