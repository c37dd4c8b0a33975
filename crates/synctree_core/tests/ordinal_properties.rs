//! Property tests for ordinal positions.

use proptest::prelude::*;
use synctree_core::Ordinal;

/// Valid ordinals: integer images, optionally subdivided a few times.
fn ordinal_strategy() -> impl Strategy<Value = Ordinal> {
    (any::<i64>(), prop::collection::vec(any::<bool>(), 0..6)).prop_map(|(x, steps)| {
        let mut ordinal = Ordinal::from_i64(x);
        for before in steps {
            ordinal = if before {
                ordinal.create_before().unwrap()
            } else {
                ordinal.create_after().unwrap()
            };
        }
        ordinal
    })
}

proptest! {
    #[test]
    fn from_i64_preserves_order(x in any::<i64>(), y in any::<i64>()) {
        let (a, b) = (Ordinal::from_i64(x), Ordinal::from_i64(y));
        prop_assert_eq!(x.cmp(&y), a.cmp(&b));
        prop_assert!(a.is_valid());
    }

    #[test]
    fn to_i64_inverts_from_i64(x in any::<i64>()) {
        prop_assert_eq!(Ordinal::from_i64(x).to_i64(), x);
    }

    #[test]
    fn between_is_strictly_between(a in ordinal_strategy(), b in ordinal_strategy()) {
        prop_assume!(a != b);
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let mid = low.create_between(&high).unwrap();
        prop_assert!(mid.is_valid());
        prop_assert!(low < mid, "{low} !< {mid}");
        prop_assert!(mid < high, "{mid} !< {high}");
    }

    #[test]
    fn before_and_after_bracket(a in ordinal_strategy()) {
        let before = a.create_before().unwrap();
        let after = a.create_after().unwrap();
        prop_assert!(before < a);
        prop_assert!(a < after);
        prop_assert!(before.is_valid() && after.is_valid());
    }

    #[test]
    fn repeated_insertion_stays_ordered(x in any::<i64>(), y in any::<i64>(), rounds in 1usize..40) {
        prop_assume!(x != y);
        let (low, mut high) = (Ordinal::from_i64(x.min(y)), Ordinal::from_i64(x.max(y)));
        for _ in 0..rounds {
            let mid = low.create_between(&high).unwrap();
            prop_assert!(low < mid && mid < high);
            high = mid;
        }
    }

    #[test]
    fn hex_round_trip(a in ordinal_strategy()) {
        prop_assert_eq!(Ordinal::from_hex(&a.to_hex()).unwrap(), a);
    }
}

#[test]
fn subdivided_values_do_not_round_trip_through_integers() {
    let a = Ordinal::from_i64(10);
    let b = Ordinal::from_i64(11);
    let mid = a.create_between(&b).unwrap();
    // The integer image only sees the first eight digits.
    assert_eq!(mid.to_i64(), 10);
    assert_ne!(Ordinal::from_i64(mid.to_i64()), mid);
}
