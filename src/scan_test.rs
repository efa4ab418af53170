use super::*;

#[test]
fn test_predicate_matches() {
    let range = Predicate::Range {
        col: 0,
        lo: Bound::Included(Value::Int64(10)),
        hi: Bound::Excluded(Value::Int64(20)),
    };
    assert!(range.matches(&Value::Int64(10)));
    assert!(range.matches(&Value::Int64(19)));
    assert!(!range.matches(&Value::Int64(20)));
    assert!(!range.matches(&Value::Int64(9)));
    assert!(!range.matches(&Value::Null));

    let eq = Predicate::Equals {
        col: 1,
        value: Value::String("b".to_string()),
    };
    assert!(eq.matches(&Value::String("b".to_string())));
    assert!(!eq.matches(&Value::String("a".to_string())));

    let inlist = Predicate::InList {
        col: 1,
        values: vec![Value::Int32(1), Value::Int32(3)],
    };
    assert!(inlist.matches(&Value::Int32(3)));
    assert!(!inlist.matches(&Value::Int32(2)));

    assert!(Predicate::IsNull { col: 0 }.matches(&Value::Null));
    assert!(!Predicate::IsNull { col: 0 }.matches(&Value::Int32(0)));
    assert!(Predicate::IsNotNull { col: 0 }.matches(&Value::Int32(0)));

    // bloom membership over cell bytes
    let bloom = {
        let mut bloom = Xor8::<BuildHasherDefault>::new();
        for i in 0..100_i64 {
            let mut bytes = vec![];
            encode_cell(&Value::Int64(i * 2), &mut bytes).unwrap();
            bloom.insert(&bytes);
        }
        bloom.build().unwrap();
        Arc::new(bloom)
    };
    let pred = Predicate::InBloom { col: 0, bloom };
    assert!(pred.matches(&Value::Int64(42)));
    // false positives are possible but the vast majority of misses
    // stay misses
    let misses = (0..1000_i64)
        .filter(|i| !pred.matches(&Value::Int64(i * 2 + 1)))
        .count();
    assert!(misses > 900, "only {} misses", misses);
}

#[test]
fn test_merge_scan_prefers_live() {
    struct VecSource(std::vec::IntoIter<Result<ScanRow>>);

    impl Iterator for VecSource {
        type Item = Result<ScanRow>;
        fn next(&mut self) -> Option<Self::Item> {
            self.0.next()
        }
    }
    impl ScanSource for VecSource {}

    let row = |key: u8, word: &str, deleted: bool| ScanRow {
        key: vec![key],
        cells: vec![Value::String(word.to_string())],
        deleted,
    };

    // source one: ghost of key 2, live keys 1 and 3
    let one = vec![
        Ok(row(1, "a", false)),
        Ok(row(2, "stale", true)),
        Ok(row(3, "c", false)),
    ];
    // source two: the live, reinserted key 2
    let two = vec![Ok(row(2, "fresh", false)), Ok(row(4, "d", true))];

    let merged: Vec<ScanRow> = MergeScan::new(vec![
        Box::new(VecSource(one.into_iter())),
        Box::new(VecSource(two.into_iter())),
    ])
    .map(|r| r.unwrap())
    .collect();

    let keys: Vec<u8> = merged.iter().map(|r| r.key[0]).collect();
    assert_eq!(keys, vec![1, 2, 3, 4]);

    // the live version of key 2 won
    assert!(!merged[1].deleted);
    assert_eq!(merged[1].cells[0], Value::String("fresh".to_string()));
    // key 4 only exists as a ghost, so the ghost surfaces
    assert!(merged[3].deleted);
}
