//! Round trips and zero/error flag behaviour

mod common;

use btt_rs::{Btt, BttError, ErrorKind, LayoutState, MIN_SIZE};
use common::{mem_namespace, tagged_block, CountingNamespace, PARENT_UUID};

#[test]
fn test_round_trip_across_block_sizes() {
    for lbasize in [512u32, 520, 4096] {
        let btt = Btt::open(mem_namespace(), MIN_SIZE, lbasize, PARENT_UUID, 0).unwrap();
        let last = btt.block_count() - 1;

        for lba in [0, 1, last / 2, last] {
            let block = tagged_block(lba, lba as u8 ^ 0x5a, lbasize as usize);
            btt.write(0, lba, &block).unwrap();

            let mut buf = vec![0u8; lbasize as usize];
            btt.read(1, lba, &mut buf).unwrap();
            assert_eq!(buf, block, "block {} with size {}", lba, lbasize);
        }
    }
}

#[test]
fn test_never_written_blocks_read_zero() {
    let btt = Btt::open(mem_namespace(), MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    btt.write(0, 100, &tagged_block(100, 1, 512)).unwrap();

    let mut buf = vec![0xffu8; 512];
    for lba in [0, 99, 101, btt.block_count() - 1] {
        btt.read(0, lba, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}

#[test]
fn test_overwrite_returns_latest() {
    let btt = Btt::open(mem_namespace(), MIN_SIZE, 512, PARENT_UUID, 0).unwrap();

    // more rewrites than free blocks, so every free block gets recycled
    for round in 0..600u32 {
        let lane = (round % 3) as usize;
        btt.write(lane, 7, &tagged_block(7, round as u8, 512)).unwrap();
    }

    let mut buf = vec![0u8; 512];
    btt.read(0, 7, &mut buf).unwrap();
    assert_eq!(buf, tagged_block(7, (599 % 256) as u8, 512));
}

#[test]
fn test_set_zero_reads_zero() {
    let btt = Btt::open(mem_namespace(), MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    btt.write(0, 12, &tagged_block(12, 9, 512)).unwrap();
    btt.set_zero(0, 12).unwrap();

    let mut buf = vec![0xffu8; 512];
    btt.read(0, 12, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    // writing again brings data back
    btt.write(0, 12, &tagged_block(12, 3, 512)).unwrap();
    btt.read(0, 12, &mut buf).unwrap();
    assert_eq!(buf, tagged_block(12, 3, 512));
}

#[test]
fn test_second_set_zero_issues_no_write() {
    let ns = CountingNamespace::new(mem_namespace());
    let btt = Btt::open(ns, MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    btt.write(0, 4, &tagged_block(4, 1, 512)).unwrap();

    let before = btt.namespace().writes();
    btt.set_zero(0, 4).unwrap();
    let after_first = btt.namespace().writes();
    assert_eq!(after_first, before + 1);

    btt.set_zero(0, 4).unwrap();
    assert_eq!(btt.namespace().writes(), after_first);
}

#[test]
fn test_set_zero_without_layout_writes_nothing() {
    let ns = CountingNamespace::new(mem_namespace());
    let btt = Btt::open(ns, MIN_SIZE, 512, PARENT_UUID, 0).unwrap();

    btt.set_zero(0, 4).unwrap();
    assert_eq!(btt.namespace().writes(), 0);
    assert_eq!(btt.layout_state(), LayoutState::Absent);
}

#[test]
fn test_write_issues_four_namespace_writes() {
    let ns = CountingNamespace::new(mem_namespace());
    let btt = Btt::open(ns, MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    btt.write(0, 0, &tagged_block(0, 1, 512)).unwrap();

    let before = btt.namespace().writes();
    btt.write(0, 1, &tagged_block(1, 1, 512)).unwrap();
    // data, two flog halves, map entry
    assert_eq!(btt.namespace().writes(), before + 4);
}

#[test]
fn test_set_error_fails_reads() {
    let btt = Btt::open(mem_namespace(), MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    btt.write(0, 30, &tagged_block(30, 1, 512)).unwrap();
    btt.set_error(0, 30).unwrap();

    let mut buf = vec![0u8; 512];
    let err = btt.read(0, 30, &mut buf).unwrap_err();
    assert!(matches!(err, BttError::BlockError { lba: 30 }));
    assert_eq!(err.kind(), ErrorKind::Io);

    // other blocks are unaffected
    btt.read(0, 31, &mut buf).unwrap();
}

#[test]
fn test_flags_survive_reopen() {
    let inner = mem_namespace();
    {
        let btt = Btt::open(inner.clone(), MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
        btt.write(0, 1, &tagged_block(1, 1, 512)).unwrap();
        btt.write(0, 2, &tagged_block(2, 2, 512)).unwrap();
        btt.set_zero(0, 1).unwrap();
        btt.set_error(0, 2).unwrap();
    }

    let mut btt = Btt::open(inner, MIN_SIZE, 512, PARENT_UUID, 0).unwrap();
    let mut buf = vec![0xffu8; 512];
    btt.read(0, 1, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    assert!(matches!(
        btt.read(0, 2, &mut buf),
        Err(BttError::BlockError { lba: 2 })
    ));
    assert!(btt.check().unwrap().is_consistent());
}
