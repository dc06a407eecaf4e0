use pepexd_storage::memory::MemoryStore;
use pepexd_storage::{clear_column, Column, KeyValueStore, WriteBatch};

#[test]
fn clear_column_spans_multiple_chunks() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    for i in 0u32..25_000 {
        batch.put(Column::TxIndex, i.to_be_bytes(), b"x");
    }
    batch.put(Column::Meta, b"schema", b"1");
    store.write_batch(&batch).expect("commit");

    let removed = clear_column(&store, Column::TxIndex).expect("clear");
    assert_eq!(removed, 25_000);
    assert_eq!(store.len(Column::TxIndex).expect("len"), 0);
    assert_eq!(
        store.get(Column::Meta, b"schema").expect("get"),
        Some(b"1".to_vec())
    );
}
