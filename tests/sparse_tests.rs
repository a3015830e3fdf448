use quickcheck::quickcheck;
use rs2_flow::SparseSeq;

#[test]
fn test_create_marks_every_slot_present() {
    let seq = SparseSeq::create(vec!["a", "b", "c"]);
    assert_eq!(seq.len(), 3);
    assert_eq!(seq.present_count(), 3);
    assert_eq!(seq.iter().copied().collect::<String>(), "abc");
}

#[test]
fn test_map_keeps_positions() {
    let seq = SparseSeq::wrap(vec![Some(1), None, Some(3)]);
    let mapped = seq.map(|n| n * 10);
    assert_eq!(mapped.into_slots(), vec![Some(10), None, Some(30)]);
}

#[test]
fn test_map_iter_is_lazy() {
    let seq = SparseSeq::wrap(vec![Some(1), None, Some(3), Some(4)]);
    let mut calls = 0;
    let mut mapped = seq.map_iter(|n| {
        calls += 1;
        n * 10
    });
    assert_eq!(mapped.next(), Some(Some(10)));
    assert_eq!(mapped.next(), Some(None));
    drop(mapped);
    assert_eq!(calls, 1);

    let collected: SparseSeq<i32> = seq.map_iter(|n| n + 1).collect();
    assert_eq!(collected.into_slots(), vec![Some(2), None, Some(4), Some(5)]);
    assert_eq!(seq.present_count(), 3);
}

#[test]
fn test_replace_consumes_values_in_order() {
    let seq = SparseSeq::wrap(vec![None, Some('a'), Some('b'), None, Some('c')]);
    let replaced = seq.replace(vec![1, 2, 3]);
    assert_eq!(replaced.into_slots(), vec![None, Some(1), Some(2), None, Some(3)]);
}

#[test]
fn test_replace_ignores_extra_values() {
    let seq = SparseSeq::wrap(vec![Some(1), None]);
    let replaced = seq.replace(vec!["x", "y", "z"]);
    assert_eq!(replaced.into_slots(), vec![Some("x"), None]);
}

#[test]
fn test_replace_optional_can_empty_a_slot() {
    let seq = SparseSeq::create(vec![1, 2, 3]);
    let replaced = seq.replace_optional(vec![Some("one"), None, Some("three")]);
    assert_eq!(replaced.present_count(), 2);
    assert!(!replaced.is_present(1));
    assert_eq!(replaced.get(2), Some(&"three"));
}

#[test]
fn test_merge_empties() {
    let original = SparseSeq::create(vec!["a", "b", "c", "d"]);
    let downstream = SparseSeq::wrap(vec![Some(1), None, Some(3), None]);
    let merged = original.merge_empties(&downstream);
    assert_eq!(merged.into_slots(), vec![Some("a"), None, Some("c"), None]);
}

#[test]
fn test_merge_empties_with_shorter_other_keeps_the_tail() {
    let original = SparseSeq::create(vec![1, 2, 3]);
    let downstream: SparseSeq<()> = SparseSeq::wrap(vec![None]);
    let merged = original.merge_empties(&downstream);
    assert_eq!(merged.into_slots(), vec![None, Some(2), Some(3)]);
}

#[test]
fn test_into_iter_and_collect() {
    let seq: SparseSeq<i32> = vec![Some(4), None, Some(6)].into_iter().collect();
    let values: Vec<i32> = seq.into_iter().collect();
    assert_eq!(values, vec![4, 6]);
}

#[test]
fn test_empty_sequence() {
    let seq: SparseSeq<u8> = SparseSeq::default();
    assert!(seq.is_empty());
    assert_eq!(seq.replace(Vec::<u8>::new()), SparseSeq::default());
}

quickcheck! {
    fn prop_map_preserves_presence(slots: Vec<Option<i32>>) -> bool {
        let seq = SparseSeq::wrap(slots);
        let presence = seq.presence();
        seq.map(|n| n.wrapping_add(1)).presence() == presence
    }

    fn prop_replace_with_own_values_is_identity(slots: Vec<Option<u16>>) -> bool {
        let seq = SparseSeq::wrap(slots);
        let values: Vec<u16> = seq.iter().copied().collect();
        seq.replace(values) == seq
    }

    fn prop_merge_empties_never_adds_values(left: Vec<Option<u8>>, right: Vec<Option<u8>>) -> bool {
        let left = SparseSeq::wrap(left);
        let right = SparseSeq::wrap(right);
        let merged = left.clone().merge_empties(&right);
        merged.len() == left.len()
            && merged.present_count() <= left.present_count()
            && (0..merged.len()).all(|i| !merged.is_present(i) || merged.get(i) == left.get(i))
    }
}
