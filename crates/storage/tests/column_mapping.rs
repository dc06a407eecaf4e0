use std::collections::HashSet;

use pepexd_storage::Column;

#[test]
fn column_positions_follow_declaration_order() {
    for (position, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), position, "{column:?} out of place");
    }
}

#[test]
fn partition_names_are_unique_and_stable() {
    let names: Vec<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    let unique: HashSet<&str> = names.iter().copied().collect();
    assert_eq!(unique.len(), names.len());
    // On-disk partition names; renaming one orphans existing data.
    assert_eq!(Column::Meta.as_str(), "meta");
    assert_eq!(Column::Utxo.as_str(), "utxo");
    assert_eq!(Column::History.as_str(), "history");
    assert_eq!(Column::HeaderByHeight.as_str(), "header_by_height");
}
