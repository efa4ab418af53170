use std::sync::Arc;

use super::*;
use crate::drs::mod_test::{build_drs, drs_key, test_store};

#[test]
fn test_rowset_tree_routing() {
    let store = test_store("tree-routing");

    // three rowsets: [0,9], [5,14], [20,29]
    let a = Arc::new(build_drs(&store, 1, 0, 10));
    let b = Arc::new(build_drs(&store, 2, 5, 10));
    let c = Arc::new(build_drs(&store, 3, 20, 10));

    let mrs = Arc::new(crate::mrs::MemRowSet::new("tree-mrs"));
    // intentionally unsorted input; the tree orders by min key
    let tree = RowSetTree::new(Arc::clone(&mrs), vec![c.clone(), a.clone(), b.clone()]);
    assert_eq!(tree.len(), 4);

    // point stabs return every covering rowset and no other
    let hits = tree.find_drs_containing(&drs_key(7));
    let ids: Vec<u64> = hits.iter().map(|rs| rs.to_rowset_id()).collect();
    assert_eq!(ids, vec![1, 2]);

    let hits = tree.find_drs_containing(&drs_key(2));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].to_rowset_id(), 1);

    let hits = tree.find_drs_containing(&drs_key(25));
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].to_rowset_id(), 3);

    assert!(tree.find_drs_containing(&drs_key(16)).is_empty());
    assert!(tree.find_drs_containing(&drs_key(100)).is_empty());

    // a write probe ends with the MemRowSet
    let refs = tree.find_rowsets_containing(&drs_key(7));
    assert_eq!(refs.len(), 3);
    assert!(matches!(refs.last(), Some(RowSetRef::Mrs(_))));

    // range intersection, [k, p) style
    let range = (
        std::ops::Bound::Included(drs_key(8)),
        std::ops::Bound::Excluded(drs_key(21)),
    );
    let hits = tree.find_drs_intersecting(&range);
    let ids: Vec<u64> = hits.iter().map(|rs| rs.to_rowset_id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // a range entirely within the gap hits nothing
    let range = (
        std::ops::Bound::Included(drs_key(15)),
        std::ops::Bound::Excluded(drs_key(19)),
    );
    assert!(tree.find_drs_intersecting(&range).is_empty());

    // an upper bound exactly at a min key excludes it
    let range = (
        std::ops::Bound::Included(drs_key(15)),
        std::ops::Bound::Excluded(drs_key(20)),
    );
    assert!(tree.find_drs_intersecting(&range).is_empty());
}
