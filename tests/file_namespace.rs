//! File-backed namespace tests

mod common;

use btt_rs::{Btt, BttBuilder, FileNamespace, MIN_SIZE};
use common::{tagged_block, PARENT_UUID};
use tempfile::TempDir;

#[test]
fn test_file_table_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("btt.img");

    let uuid = {
        let ns = FileNamespace::create(&path, 2 * MIN_SIZE).unwrap();
        let btt = Btt::open(ns, 2 * MIN_SIZE, 4096, PARENT_UUID, 4).unwrap();
        for lba in 0..32 {
            btt.write((lba % 4) as usize, lba, &tagged_block(lba, 0x10, 4096))
                .unwrap();
        }
        btt.set_zero(0, 3).unwrap();
        btt.uuid()
    };

    let ns = FileNamespace::open(&path).unwrap();
    let mut btt = Btt::open(ns, 2 * MIN_SIZE, 4096, PARENT_UUID, 4).unwrap();
    assert_eq!(btt.uuid(), uuid);

    let mut buf = vec![0u8; 4096];
    for lba in 0..32 {
        btt.read(0, lba, &mut buf).unwrap();
        if lba == 3 {
            assert!(buf.iter().all(|&b| b == 0));
        } else {
            assert_eq!(buf, tagged_block(lba, 0x10, 4096));
        }
    }

    assert!(btt.check().unwrap().is_consistent());
}

#[test]
fn test_builder_uses_whole_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("whole.img");

    let created = BttBuilder::new()
        .block_size(512)
        .parent_uuid(PARENT_UUID)
        .create_file(&path, MIN_SIZE + MIN_SIZE / 2)
        .unwrap();
    let nlba = created.block_count();
    created.write(0, nlba - 1, &tagged_block(nlba - 1, 1, 512)).unwrap();
    drop(created);

    let btt = BttBuilder::new()
        .block_size(512)
        .parent_uuid(PARENT_UUID)
        .open_file(&path)
        .unwrap();
    assert_eq!(btt.block_count(), nlba);
    assert_eq!(btt.namespace().len(), MIN_SIZE + MIN_SIZE / 2);

    let mut buf = vec![0u8; 512];
    btt.read(0, nlba - 1, &mut buf).unwrap();
    assert_eq!(buf, tagged_block(nlba - 1, 1, 512));
}
