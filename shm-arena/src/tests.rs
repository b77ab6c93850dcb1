use crate::{ArenaError, ArenaOptions, Block, IpcAllocator, Payload, SegmentError};
use serde_json::json;
use tempfile::TempDir;

fn options(dir: &TempDir, name: &str, size: usize) -> ArenaOptions {
    let mut options = ArenaOptions::new(name, size);
    options.registry = dir.path().to_owned();
    options
}

fn ready(dir: &TempDir, name: &str, size: usize) -> IpcAllocator {
    let mut arena = IpcAllocator::new(options(dir, name, size));
    arena.init().expect("to initialize the arena");
    arena
}

#[test]
fn operations_require_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = IpcAllocator::new(options(&dir, "uninit", 1 << 16));

    assert!(matches!(arena.malloc(8, "x"), Err(ArenaError::NotInitialized)));
    assert!(matches!(arena.free(1024), Err(ArenaError::NotInitialized)));
    assert!(matches!(arena.write(1024, b"x"), Err(ArenaError::NotInitialized)));
    assert!(matches!(arena.read(1024), Err(ArenaError::NotInitialized)));
    assert!(matches!(arena.stats(), Err(ArenaError::NotInitialized)));
    assert!(matches!(arena.refresh(), Err(ArenaError::NotInitialized)));
}

#[test]
fn init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "idempotent", 1 << 16);
    let block = arena.malloc(16, "x").unwrap();

    assert_eq!(arena.init().unwrap(), 1 << 16);
    assert_eq!(arena.open().unwrap(), 1 << 16);
    assert_eq!(arena.allocation(block.offset).map(|a| a.size), Some(16));
    assert_eq!(arena.next_offset(), 1024 + 16);
}

#[test]
fn failed_init_can_be_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = ready(&dir, "contested", 1 << 16);

    let mut arena = IpcAllocator::new(options(&dir, "contested", 1 << 16));
    let err = arena.init().unwrap_err();
    assert!(
        matches!(err, ArenaError::Segment(SegmentError::Creation { .. })),
        "{err}"
    );
    assert!(!arena.is_initialized());
    assert_eq!(arena.next_offset(), 0);

    holder.close();
    assert_eq!(arena.init().unwrap(), 1 << 16);
    assert!(arena.is_initialized());
}

#[test]
fn header_must_fit_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir, "layout", 512);
    options.header_size = 1024;

    let mut arena = IpcAllocator::new(options);
    let err = arena.init().unwrap_err();
    assert!(
        matches!(err, ArenaError::InvalidLayout { header_size: 1024, size: 512 }),
        "{err}"
    );
    assert!(!arena.is_initialized());
}

#[test]
fn zero_sized_allocation_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "zero", 1 << 16);
    assert!(matches!(arena.malloc(0, "x"), Err(ArenaError::ZeroSized)));
    assert_eq!(arena.next_offset(), 1024);
}

#[test]
fn sizes_are_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir, "aligned", 1 << 20);
    options.header_size = 8192;
    let mut arena = IpcAllocator::new(options);
    arena.init().unwrap();

    let mut expected_offset = 8192;
    for size in (1..=40).chain([63, 64, 65, 1000, 4097]) {
        let block = arena.malloc(size, "x").unwrap();
        assert_eq!(block.size % 8, 0, "{size}");
        assert!(block.size >= size && block.size < size + 8, "{size}");
        assert_eq!(block.offset, expected_offset);
        expected_offset += block.size;
    }

    assert_eq!(arena.next_offset(), expected_offset);
}

#[test]
fn capacity_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "boundary", 65536);

    let err = arena.malloc(65536 - 1024 + 1, "x").unwrap_err();
    assert!(
        matches!(err, ArenaError::OutOfMemory { requested: 64513, available: 64512 }),
        "{err}"
    );

    let block = arena.malloc(65536 - 1024, "x").unwrap();
    assert_eq!(block, Block { offset: 1024, size: 64512 });
    assert_eq!(arena.next_offset(), 65536);

    assert!(matches!(
        arena.malloc(1, "x"),
        Err(ArenaError::OutOfMemory { available: 0, .. })
    ));
}

#[test]
fn capacity_boundary_after_alignment() {
    let dir = tempfile::tempdir().unwrap();
    // The remaining capacity is not a multiple of the alignment.
    let mut arena = ready(&dir, "unaligned-tail", 65540);

    let remaining = 65540 - 1024;
    assert!(matches!(
        arena.malloc(remaining, "x"),
        Err(ArenaError::OutOfMemory { .. })
    ));
    assert_eq!(arena.malloc(remaining - 4, "x").unwrap().size, remaining - 4);
}

#[test]
fn huge_request_does_not_overflow() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "huge", 1 << 16);
    assert!(matches!(
        arena.malloc(usize::MAX, "x"),
        Err(ArenaError::OutOfMemory { .. })
    ));
}

#[test]
fn raw_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "raw", 1 << 16);
    let block = arena.malloc(16, "blob").unwrap();

    let data: Vec<u8> = (0..16).collect();
    assert_eq!(arena.write(block.offset, &data).unwrap(), 16);
    assert_eq!(arena.read(block.offset).unwrap(), Payload::Raw(data));

    // A shorter write leaves no trace of the longer one.
    arena.write(block.offset, b"abc").unwrap();
    let mut expected = b"abc".to_vec();
    expected.resize(16, 0);
    assert_eq!(arena.read(block.offset).unwrap(), Payload::Raw(expected));
}

#[test]
fn json_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "json", 1 << 16);
    let block = arena.malloc(128, "json").unwrap();

    let value = json!({ "cpu": [12.5, 3.0], "name": "host" });
    arena.write_json(block.offset, &value).unwrap();
    assert_eq!(arena.read(block.offset).unwrap(), Payload::Json(value));

    // Overwriting with a shorter document must not leave a stale tail.
    arena.write_json(block.offset, &json!(1)).unwrap();
    assert_eq!(arena.read(block.offset).unwrap().into_json(), Some(json!(1)));
}

#[test]
fn unreadable_json_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "partial", 1 << 16);
    let block = arena.malloc(32, "systemStats").unwrap();

    assert!(matches!(
        arena.read(block.offset).unwrap(),
        Payload::Undecodable { .. }
    ));

    arena.write(block.offset, br#"{"cpu":"#).unwrap();
    match arena.read(block.offset).unwrap() {
        Payload::Undecodable { bytes, .. } => assert!(bytes.starts_with(br#"{"cpu":"#)),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn oversized_write_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "oversized", 1 << 16);
    let block = arena.malloc(5, "blob").unwrap();

    let err = arena.write(block.offset, &[1; 9]).unwrap_err();
    assert!(
        matches!(err, ArenaError::AllocationSizeExceeded { len: 9, size: 8, .. }),
        "{err}"
    );

    let err = arena.write_json(block.offset, "a long string").unwrap_err();
    assert!(matches!(err, ArenaError::AllocationSizeExceeded { .. }), "{err}");
}

#[test]
fn unknown_offsets_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "unknown", 1 << 16);
    let block = arena.malloc(16, "x").unwrap();

    // Inside the allocation, but not its start.
    let inner = block.offset + 8;
    assert!(matches!(arena.read(inner), Err(ArenaError::InvalidOffset { offset }) if offset == inner));
    assert!(matches!(arena.write(inner, b"x"), Err(ArenaError::InvalidOffset { .. })));
    assert!(matches!(arena.free(inner), Err(ArenaError::InvalidOffset { .. })));
}

#[test]
fn freed_allocation_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "freed", 1 << 16);
    let block = arena.malloc(16, "x").unwrap();
    arena.free(block.offset).unwrap();

    assert!(matches!(arena.read(block.offset), Err(ArenaError::InvalidOffset { .. })));
    assert!(matches!(arena.write(block.offset, b"x"), Err(ArenaError::InvalidOffset { .. })));
    assert!(matches!(arena.free(block.offset), Err(ArenaError::InvalidOffset { .. })));

    // Freed space is not handed out again.
    let next = arena.malloc(16, "x").unwrap();
    assert!(next.offset >= block.offset + block.size);
}

#[test]
fn stats_track_live_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "stats", 1 << 16);

    let check = |arena: &IpcAllocator| {
        let stats = arena.stats().unwrap();
        let sum: usize = arena.allocations().map(|a| a.size).sum();
        assert_eq!(stats.allocated, sum);
        assert_eq!(stats.allocated + stats.free, stats.total_size);
        assert_eq!(stats.allocation_count, arena.allocations().count());
        stats
    };

    let empty = check(&arena);
    assert_eq!(empty.total_size, 1 << 16);
    assert_eq!(empty.usage_percent, 0.0);

    let mut blocks = vec![];
    for size in [3, 100, 7, 256] {
        blocks.push(arena.malloc(size, "x").unwrap());
        check(&arena);
    }

    for block in blocks.iter().step_by(2) {
        arena.free(block.offset).unwrap();
        check(&arena);
    }

    let stats = check(&arena);
    assert_eq!(stats.allocated, 104 + 256);
    assert!((stats.usage_percent - 360.0 / 65536.0 * 100.0).abs() < 1e-9);
}

#[test]
fn header_overflow_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir, "crowded", 1 << 16);
    options.header_size = 256;
    let mut arena = IpcAllocator::new(options);
    arena.init().unwrap();

    let mut count = 0;
    let err = loop {
        match arena.malloc(8, "x") {
            Ok(_) => count += 1,
            Err(err) => break err,
        }

        assert!(count < 100, "the table never overflowed");
    };

    assert!(
        matches!(err, ArenaError::HeaderOverflow { capacity: 256, needed } if needed > 256),
        "{err}"
    );

    // The failed allocation left no trace.
    assert_eq!(arena.allocations().count(), count);
    assert_eq!(arena.next_offset(), 256 + 8 * count);

    // Freeing shrinks the table and makes room again.
    let first = arena.allocations().next().unwrap().offset;
    arena.free(first).unwrap();
    arena.malloc(8, "x").unwrap();
}

#[test]
fn close_resets() {
    let dir = tempfile::tempdir().unwrap();
    let mut arena = ready(&dir, "closed", 1 << 16);
    arena.malloc(8, "x").unwrap();

    arena.close();
    arena.close();

    assert!(!arena.is_initialized());
    assert_eq!(arena.next_offset(), 0);
    assert_eq!(arena.allocations().count(), 0);
    assert!(matches!(arena.stats(), Err(ArenaError::NotInitialized)));

    // A fresh start, with an empty table.
    arena.init().unwrap();
    assert_eq!(arena.next_offset(), 1024);
    assert_eq!(arena.stats().unwrap().allocation_count, 0);
}
