#![no_main]
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};
use opcstream_rs::{SecondaryStorageLock, SparseConfig, SparseMemoryStream};

#[derive(Debug, Arbitrary)]
enum Op {
    Write { offset: u16, data: Vec<u8> },
    SetLen(u16),
    Read { offset: u16, len: u8 },
}

#[derive(Debug, Arbitrary)]
struct Input {
    low: u16,
    spread: u16,
    merge_gaps: bool,
    ops: Vec<Op>,
}

// Sparse stream must agree with a flat Vec model across spills and reloads
fuzz_target!(|input: Input| {
    let mut config = SparseConfig::with_water_marks(
        u64::from(input.low),
        u64::from(input.low) + u64::from(input.spread),
    );
    config.auto_merge_gaps = input.merge_gaps;
    let mut stream = SparseMemoryStream::new(&config, SecondaryStorageLock::new());
    let mut model: Vec<u8> = Vec::new();

    for op in input.ops.iter().take(64) {
        match op {
            Op::Write { offset, data } => {
                let start = usize::from(*offset);
                stream.write_at(start as u64, data).unwrap();
                if !data.is_empty() {
                    if model.len() < start + data.len() {
                        model.resize(start + data.len(), 0);
                    }
                    model[start..start + data.len()].copy_from_slice(data);
                }
            }
            Op::SetLen(len) => {
                stream.set_len(u64::from(*len)).unwrap();
                model.resize(usize::from(*len), 0);
            }
            Op::Read { offset, len } => {
                let start = usize::from(*offset);
                let mut buf = vec![0xCC; usize::from(*len)];
                let n = stream.read_at(start as u64, &mut buf).unwrap();
                let expected = model.len().saturating_sub(start).min(buf.len());
                assert_eq!(n, expected);
                assert_eq!(&buf[..n], &model[start..start + n]);
            }
        }
        assert_eq!(stream.len(), model.len() as u64);
    }
});
