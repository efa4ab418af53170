use std::sync::Arc;

use super::*;
use crate::delta::mod_test::sample_schema;

#[test]
fn test_dms_ordering_and_lookup() {
    let schema = sample_schema();
    let dms = DeltaMemStore::new("test-dms");
    assert!(dms.is_empty());

    // interleave rows and timestamps out of order
    for (row_id, ts) in [(5_u32, 30_u64), (1, 10), (5, 20), (3, 25), (1, 40)] {
        let change = RowChange::Update {
            cols: vec![(2, Some(crate::row::Value::Int32(ts as i32)))],
        };
        dms.add(&schema, row_id, Timestamp(ts), 7, &change).unwrap();
    }
    assert_eq!(dms.len(), 5);
    assert_eq!(dms.min_log_index(), Some(7));

    // per-row lookups come back timestamp ascending
    let deltas = dms.deltas_for_row(&schema, 5).unwrap();
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0].0, Timestamp(20));
    assert_eq!(deltas[1].0, Timestamp(30));
    assert!(dms.deltas_for_row(&schema, 2).unwrap().is_empty());

    // range extraction covers [1, 5)
    let deltas = dms.deltas_in_range(&schema, 1, 5).unwrap();
    assert_eq!(deltas.len(), 3);
    assert!(deltas.iter().all(|(k, _)| k.row_id == 1 || k.row_id == 3));

    // full iteration is key ascending
    let all: Vec<DeltaKey> = dms
        .iter(Arc::new(schema))
        .map(|e| e.unwrap().0)
        .collect();
    for pair in all.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    let stats = dms.to_stats();
    assert_eq!(stats.update_count(), 5);
    assert!(dms.ram_anchored() > 0);
}
