#![cfg(feature = "fjall")]

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use umbra_storage::fjall::FjallStore;
use umbra_storage::{Column, KeyValueStore, WriteBatch};

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let mut dir = std::env::temp_dir();
    dir.push(format!("umbra_{tag}_{nanos}"));
    dir
}

#[test]
fn fjall_roundtrip_and_batch() {
    let dir = scratch_dir("fjall_smoke");
    let store = FjallStore::open(&dir).expect("open fjall");

    store
        .put(Column::BlockIndex, b"tip", b"genesis")
        .expect("put");
    assert_eq!(
        store.get(Column::BlockIndex, b"tip").expect("get"),
        Some(b"genesis".to_vec())
    );

    store.put(Column::TxIndex, b"tx:1", b"a").expect("put");
    store.put(Column::TxIndex, b"tx:2", b"b").expect("put");
    let scanned: HashSet<(Vec<u8>, Vec<u8>)> = store
        .scan_prefix(Column::TxIndex, b"tx:")
        .expect("scan")
        .into_iter()
        .collect();
    assert_eq!(
        scanned,
        HashSet::from([
            (b"tx:1".to_vec(), b"a".to_vec()),
            (b"tx:2".to_vec(), b"b".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"best", b"h1");
    batch.delete(Column::BlockIndex, b"tip");
    store.write_batch(&batch).expect("batch commit");

    assert!(store.get(Column::BlockIndex, b"tip").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"best").expect("get"),
        Some(b"h1".to_vec())
    );

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fjall_survives_reopen() {
    let dir = scratch_dir("fjall_reopen");
    {
        let store = FjallStore::open(&dir).expect("open fjall");
        store
            .put(Column::Masternode, b"mn", b"record")
            .expect("put");
    }
    {
        let store = FjallStore::open(&dir).expect("reopen fjall");
        assert_eq!(
            store.get(Column::Masternode, b"mn").expect("get"),
            Some(b"record".to_vec())
        );
    }
    let _ = std::fs::remove_dir_all(&dir);
}
