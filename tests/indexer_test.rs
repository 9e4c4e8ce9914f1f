//! Grouping of item listings.

use batchtrack::error::Error;
use batchtrack::indexer::BatchIndexer;
use batchtrack::model::GroupKey;

fn grouped(keys: &[&str], size: usize) -> Vec<(u32, String)> {
    let (items, _) = BatchIndexer::new(size)
        .unwrap()
        .index(keys.iter().copied())
        .unwrap();
    items
        .into_iter()
        .map(|item| (item.group_key.0, item.item_key))
        .collect()
}

#[test]
fn sorts_before_grouping() {
    let groups = grouped(&["B_0", "A_2", "A_0"], 2);
    assert_eq!(
        groups,
        vec![
            (0, "A_0".to_string()),
            (0, "A_2".to_string()),
            (1, "B_0".to_string()),
        ]
    );
}

#[test]
fn group_count_is_ceiling_of_items_over_size() {
    let keys: Vec<String> = (0..23).map(|i| format!("S{i:03}_0")).collect();
    let (items, plan) = BatchIndexer::new(5).unwrap().index(keys).unwrap();

    assert_eq!(plan.group_count(), 5);
    assert_eq!(plan.group_sizes, vec![5, 5, 5, 5, 3]);
    assert_eq!(items.len(), 23);
    assert!(items.iter().all(|i| !i.in_progress && !i.stages.segmented && !i.stages.parcellated));
    assert_eq!(items.last().unwrap().group_key, GroupKey(4));
}

#[test]
fn grouping_ignores_input_order() {
    let forward = grouped(&["C_1", "A_0", "B_3", "A_1", "D_0"], 2);
    let reversed = grouped(&["D_0", "A_1", "B_3", "A_0", "C_1"], 2);
    assert_eq!(forward, reversed);
}

#[test]
fn duplicates_are_dropped() {
    let (items, plan) = BatchIndexer::new(10)
        .unwrap()
        .index(["A_0", "A_0", "B_0"])
        .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(plan.duplicates_dropped, 1);
}

#[test]
fn empty_listing_produces_no_groups() {
    let (items, plan) = BatchIndexer::new(3)
        .unwrap()
        .index(Vec::<String>::new())
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(plan.group_count(), 0);
}

#[test]
fn single_item_lands_in_group_zero() {
    assert_eq!(grouped(&["only"], 4), vec![(0, "only".to_string())]);
}

#[test]
fn zero_group_size_is_rejected() {
    assert!(matches!(BatchIndexer::new(0), Err(Error::Config(_))));
}
