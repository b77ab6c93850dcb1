#![cfg(target_os = "linux")]
//! Recover the allocation table from the segment in a second allocator.
use serde_json::json;
use shm_arena::{ArenaError, ArenaOptions, HeaderError, IpcAllocator, Payload, SegmentError};
use shm_segment::{SegmentOptions, SharedSegment};
use tempfile::TempDir;

fn options(dir: &TempDir, name: &str) -> ArenaOptions {
    let mut options = ArenaOptions::new(name, 65536);
    options.registry = dir.path().to_owned();
    options
}

fn table(arena: &IpcAllocator) -> Vec<(usize, usize, String)> {
    arena
        .allocations()
        .map(|a| (a.offset, a.size, a.kind.tag().to_owned()))
        .collect()
}

#[test]
fn opener_sees_the_writers_table() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "stats"));
    assert_eq!(writer.init().unwrap(), 65536);

    let first = writer.malloc(100, "stats").unwrap();
    assert_eq!((first.offset, first.size), (1024, 104));
    let second = writer.malloc(50, "stats").unwrap();
    assert_eq!((second.offset, second.size), (1128, 56));

    let stats = writer.stats().unwrap();
    assert_eq!(stats.total_size, 65536);
    assert_eq!(stats.allocated, 160);
    assert_eq!(stats.free, 65536 - 160);
    assert_eq!(stats.allocation_count, 2);
    assert!((stats.usage_percent - 160.0 / 65536.0 * 100.0).abs() < 1e-9);

    writer.free(1024).unwrap();
    assert_eq!(writer.stats().unwrap().allocation_count, 1);

    let mut reader = IpcAllocator::new(options(&dir, "stats"));
    assert_eq!(reader.open().unwrap(), 65536);
    assert_eq!(table(&reader), [(1128, 56, "stats".to_owned())]);
    assert_eq!(reader.next_offset(), 1184);
}

#[test]
fn opener_adopts_the_recorded_size() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "sized"));
    writer.init().unwrap();

    let mut configured = options(&dir, "sized");
    configured.size = 1 << 20;
    let mut reader = IpcAllocator::new(configured);
    assert_eq!(reader.open().unwrap(), 65536);
    assert_eq!(reader.stats().unwrap().total_size, 65536);
}

#[test]
fn reopening_reconstructs_the_table() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "replay"));
    writer.init().unwrap();

    let mut blocks = vec![];
    for (size, kind) in [(13, "json"), (8, "stats"), (300, "json:processList"), (1, "blob")] {
        blocks.push(writer.malloc(size, kind).unwrap());
    }
    writer.free(blocks[1].offset).unwrap();

    let mut first = IpcAllocator::new(options(&dir, "replay"));
    first.open().unwrap();
    let before = (table(&first), first.next_offset());
    first.close();

    let mut second = IpcAllocator::new(options(&dir, "replay"));
    second.open().unwrap();
    assert_eq!((table(&second), second.next_offset()), before);
    assert_eq!((table(&writer), writer.next_offset()), before);
}

#[test]
fn bump_pointer_is_recovered_from_the_last_live_allocation() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "tail"));
    writer.init().unwrap();
    let head = writer.malloc(8, "x").unwrap();
    let tail = writer.malloc(8, "x").unwrap();
    writer.free(tail.offset).unwrap();

    let mut reader = IpcAllocator::new(options(&dir, "tail"));
    reader.open().unwrap();

    // The writer never reuses the freed tail, the opener can not know it existed.
    assert_eq!(writer.next_offset(), tail.offset + tail.size);
    assert_eq!(reader.next_offset(), head.offset + head.size);
}

#[test]
fn contents_are_shared() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "contents"));
    writer.init().unwrap();
    let doc = writer.malloc(256, "systemStats").unwrap();
    let raw = writer.malloc(4, "blob").unwrap();

    let mut reader = IpcAllocator::new(options(&dir, "contents"));
    reader.open().unwrap();

    let value = json!({ "cpu": { "usage": 12.5 }, "memory": { "total": 16_000_000_000u64 } });
    writer.write_json(doc.offset, &value).unwrap();
    writer.write(raw.offset, &[0xde, 0xad, 0xbe, 0xef]).unwrap();

    // Contents need no refresh, only the table does.
    assert_eq!(reader.read(doc.offset).unwrap(), Payload::Json(value));
    assert_eq!(
        reader.read(raw.offset).unwrap(),
        Payload::Raw(vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0])
    );

    // Both directions work.
    reader.write_json(doc.offset, &json!(null)).unwrap();
    assert_eq!(writer.read(doc.offset).unwrap(), Payload::Json(json!(null)));
}

#[test]
fn refresh_picks_up_later_allocations() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "later"));
    writer.init().unwrap();

    let mut reader = IpcAllocator::new(options(&dir, "later"));
    reader.open().unwrap();
    assert_eq!(reader.allocations().count(), 0);

    let block = writer.malloc(64, "json").unwrap();
    assert!(matches!(
        reader.read(block.offset),
        Err(ArenaError::InvalidOffset { .. })
    ));

    reader.refresh().unwrap();
    assert_eq!(table(&reader), table(&writer));

    writer.free(block.offset).unwrap();
    reader.refresh().unwrap();
    assert_eq!(reader.allocations().count(), 0);
}

#[test]
fn open_without_creator() {
    let dir = tempfile::tempdir().unwrap();
    let mut reader = IpcAllocator::new(options(&dir, "absent"));

    let err = reader.open().unwrap_err();
    assert!(
        matches!(err, ArenaError::Segment(SegmentError::NotFound { ref name }) if name == "absent"),
        "{err}"
    );
    assert!(!reader.is_initialized());
}

#[test]
fn table_survives_the_creator_closing() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "round-trip"));
    writer.init().unwrap();

    let mut blocks = vec![];
    for (size, kind) in [(100, "stats"), (50, "stats"), (7, "json"), (4096, "blob")] {
        blocks.push(writer.malloc(size, kind).unwrap());
    }
    writer.free(blocks[2].offset).unwrap();
    writer.write(blocks[3].offset, b"kept").unwrap();

    let before = (table(&writer), writer.next_offset());
    writer.close();
    assert!(!writer.is_initialized());

    let mut reader = IpcAllocator::new(options(&dir, "round-trip"));
    reader.open().unwrap();
    assert_eq!((table(&reader), reader.next_offset()), before);
    assert!(reader.read(blocks[3].offset).unwrap().as_bytes().unwrap().starts_with(b"kept"));

    // The creator can reopen its own arena as well.
    writer.open().unwrap();
    assert_eq!((table(&writer), writer.next_offset()), before);
}

#[test]
fn destroy_unpublishes() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "gone"));
    writer.init().unwrap();

    let mut early = IpcAllocator::new(options(&dir, "gone"));
    early.open().unwrap();
    let block = writer.malloc(8, "blob").unwrap();
    writer.write(block.offset, b"kept").unwrap();
    early.refresh().unwrap();

    writer.destroy();
    assert!(!writer.is_initialized());

    // Existing views stay valid.
    assert_eq!(
        early.read(block.offset).unwrap().as_bytes(),
        Some(&b"kept\0\0\0\0"[..])
    );

    let mut late = IpcAllocator::new(options(&dir, "gone"));
    assert!(matches!(
        late.open(),
        Err(ArenaError::Segment(SegmentError::NotFound { .. }))
    ));
}

#[test]
fn unknown_header_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "future"));
    writer.init().unwrap();

    let mut segment = SharedSegment::new(SegmentOptions {
        name: "future".into(),
        size: 65536,
        registry: dir.path().to_owned(),
    });
    segment.open().unwrap();
    let mut future = br#"{"version":2,"chunks":[]}"#.to_vec();
    future.resize(1024, 0);
    segment.write(0, &future).unwrap();

    let mut reader = IpcAllocator::new(options(&dir, "future"));
    let err = reader.open().unwrap_err();
    assert!(
        matches!(err, ArenaError::Header(HeaderError::UnsupportedVersion(2))),
        "{err}"
    );
    assert!(!reader.is_initialized());

    // An allocator that already attached keeps its last good table.
    assert!(writer.refresh().is_err());
    assert!(writer.is_initialized());
}

#[test]
fn header_overflow_leaves_the_shared_table_intact() {
    let dir = tempfile::tempdir().unwrap();

    let mut small = options(&dir, "small-header");
    small.header_size = 200;

    let mut writer = IpcAllocator::new(small.clone());
    writer.init().unwrap();

    let err = loop {
        if let Err(err) = writer.malloc(16, "json") {
            break err;
        }
    };
    assert!(matches!(err, ArenaError::HeaderOverflow { .. }), "{err}");

    let mut reader = IpcAllocator::new(small);
    reader.open().unwrap();
    assert_eq!(table(&reader), table(&writer));
    assert_eq!(reader.next_offset(), writer.next_offset());
}

#[test]
fn mismatched_header_size_is_detected() {
    let dir = tempfile::tempdir().unwrap();

    let mut writer = IpcAllocator::new(options(&dir, "layout"));
    writer.init().unwrap();
    writer.malloc(8, "x").unwrap();

    // The opener expects the table to end earlier than it does.
    let mut short = options(&dir, "layout");
    short.header_size = 16;
    let mut reader = IpcAllocator::new(short);
    assert!(matches!(reader.open(), Err(ArenaError::Header(_))));

    // Or allocations to start later than they do.
    let mut long = options(&dir, "layout");
    long.header_size = 2048;
    let mut reader = IpcAllocator::new(long);
    assert!(matches!(
        reader.open(),
        Err(ArenaError::Header(HeaderError::Inconsistent(_)))
    ));
}
