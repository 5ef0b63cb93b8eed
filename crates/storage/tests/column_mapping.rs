use std::collections::HashSet;

use umbra_storage::Column;

#[test]
fn column_index_is_stable() {
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx, "index drifted for {column:?}");
    }
}

#[test]
fn column_names_are_distinct() {
    let names: HashSet<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
    assert!(names.contains("block_index"));
    assert!(names.contains("masternode"));
}
