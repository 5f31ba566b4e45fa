use bsdelta::container::{Container, FileEntry};
use bsdelta::patch_format::{
    CompressionAlgorithm, CompressionSettings, PatchHeader, SeriesType, SyncOp, PATCH_MAGIC,
};
use bsdelta::series::{open_patch, write_bsdiff_series, write_rsync_series, SeriesReader};
use bsdelta::util::hash_bytes;
use bsdelta::wire::{WireReader, WireWriter};
use bsdelta::Error;

const OLD_A: &[u8] = b"the quick brown fox jumps over the lazy dog, again and again";
const NEW_A: &[u8] = b"the quick brown cat jumps over the lazy dog, again and again!";

fn entry(path: &str, data: &[u8]) -> FileEntry {
    FileEntry {
        path: path.to_string(),
        size: data.len() as u64,
        hash: hash_bytes(data),
    }
}

/// Series for three new files: rsync (block + data), bsdiff, rsync (data only).
fn write_series<W: std::io::Write>(wire: &mut WireWriter<W>) {
    write_rsync_series(
        wire,
        0,
        vec![
            SyncOp::BlockRange {
                file_index: 0,
                block_index: 0,
                block_span: 1,
            },
            SyncOp::Data(b"appended".to_vec()),
        ],
    )
    .unwrap();
    write_bsdiff_series(wire, 1, 0, OLD_A, NEW_A).unwrap();
    write_rsync_series(wire, 2, vec![SyncOp::Data(b"fresh".to_vec())]).unwrap();
}

fn series_bytes() -> Vec<u8> {
    let mut w = WireWriter::new(Vec::new());
    write_series(&mut w);
    w.into_inner()
}

/// Offsets at which each series ends, parsing every message.
fn boundaries_parsed(bytes: &[u8]) -> Vec<u64> {
    let mut r = SeriesReader::new(WireReader::new(bytes), 3);
    let mut ends = Vec::new();
    while let Some(h) = r.next_series().unwrap() {
        match h.kind {
            SeriesType::Rsync => while r.next_op().unwrap().is_some() {},
            SeriesType::Bsdiff => {
                r.read_bsdiff_header().unwrap();
                let out = r.apply_bsdiff(OLD_A, NEW_A.len() as u64).unwrap();
                assert_eq!(out, NEW_A);
            }
        }
        ends.push(r.bytes_read());
    }
    ends
}

/// Offsets at which each series ends, skipping every series.
fn boundaries_skipped(bytes: &[u8]) -> Vec<u64> {
    let mut r = SeriesReader::new(WireReader::new(bytes), 3);
    let mut ends = Vec::new();
    while r.next_series().unwrap().is_some() {
        r.skip_series().unwrap();
        ends.push(r.bytes_read());
    }
    ends
}

#[test]
fn test_skip_and_parse_agree_on_boundaries() {
    let bytes = series_bytes();
    let parsed = boundaries_parsed(&bytes);
    let skipped = boundaries_skipped(&bytes);
    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed, skipped);
    assert_eq!(*parsed.last().unwrap(), bytes.len() as u64);
}

#[test]
fn test_skip_after_bsdiff_header() {
    let bytes = series_bytes();
    let mut r = SeriesReader::new(WireReader::new(&bytes[..]), 3);
    r.next_series().unwrap();
    r.skip_series().unwrap();
    let h = r.next_series().unwrap().unwrap();
    assert_eq!(h.kind, SeriesType::Bsdiff);
    assert_eq!(r.read_bsdiff_header().unwrap().target_index, 0);
    r.skip_series().unwrap();

    let h = r.next_series().unwrap().unwrap();
    assert_eq!(h.file_index, 2);
    assert_eq!(r.next_op().unwrap(), Some(SyncOp::Data(b"fresh".to_vec())));
    assert_eq!(r.next_op().unwrap(), None);
    assert_eq!(r.next_series().unwrap(), None);
}

#[test]
fn test_truncated_series_is_corrupt() {
    let bytes = series_bytes();
    let cut = &bytes[..bytes.len() - 3];
    let mut r = SeriesReader::new(WireReader::new(cut), 3);
    let mut result = Ok(());
    while let Ok(Some(_)) = r.next_series() {
        result = r.skip_series();
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(Error::Corrupt(_))));
}

fn full_patch(compression: CompressionAlgorithm) -> Vec<u8> {
    let old = Container::new(vec![entry("a.txt", OLD_A)], vec![]);
    let new = Container::new(
        vec![entry("a.txt", b""), entry("b.txt", NEW_A), entry("c.txt", b"fresh")],
        vec!["sub".to_string()],
    );

    let mut header = WireWriter::new(Vec::new());
    header.write_magic(PATCH_MAGIC).unwrap();
    let settings = CompressionSettings {
        algorithm: compression,
        quality: 1,
    };
    header
        .write_message(&PatchHeader {
            compression: settings,
        })
        .unwrap();

    let body =
        bsdelta::compression::CompressedWriter::new(header.into_inner(), &settings).unwrap();
    let mut wire = WireWriter::new(body);
    wire.write_message(&old).unwrap();
    wire.write_message(&new).unwrap();
    write_series(&mut wire);
    wire.into_inner().finish().unwrap()
}

#[test]
fn test_open_patch_reads_containers_then_series() {
    for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Zstd] {
        let bytes = full_patch(algorithm);
        let mut stream = open_patch(&bytes[..]).unwrap();
        assert_eq!(stream.header.compression.algorithm, algorithm);
        assert_eq!(stream.old.files.len(), 1);
        assert_eq!(stream.new.files.len(), 3);
        assert_eq!(stream.new.dirs, vec!["sub"]);

        let mut kinds = Vec::new();
        while let Some(h) = stream.series.next_series().unwrap() {
            kinds.push(h.kind);
            stream.series.skip_series().unwrap();
        }
        assert_eq!(
            kinds,
            vec![SeriesType::Rsync, SeriesType::Bsdiff, SeriesType::Rsync]
        );
    }
}

#[test]
fn test_open_patch_bad_magic() {
    let mut bytes = full_patch(CompressionAlgorithm::None);
    bytes[0] ^= 0xFF;
    assert!(matches!(open_patch(&bytes[..]), Err(Error::Corrupt(_))));
}
