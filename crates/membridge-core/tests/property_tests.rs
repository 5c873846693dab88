//! Property-based tests for the codec, the progress reconciler and the
//! location scanner.

use std::collections::BTreeSet;

use membridge_core::codec::{self, max_value, BitOrder, Endianness, MAX_COUNTER_WIDTH};
use membridge_core::profile::{CounterField, ResolvedGroup};
use membridge_core::remote::{ApplyOutcome, NetworkItem};
use membridge_core::scanner::GroupProgress;
use membridge_core::{ProgressCounter, ReceivedItems, Reconciliation};
use proptest::prelude::*;

// ============================================================================
// Strategy Generators
// ============================================================================

fn endianness_strategy() -> impl Strategy<Value = Endianness> {
    prop_oneof![Just(Endianness::Little), Just(Endianness::Big)]
}

fn bit_order_strategy() -> impl Strategy<Value = BitOrder> {
    prop_oneof![Just(BitOrder::Lsb0), Just(BitOrder::Msb0)]
}

/// A width together with a value that fits in it
fn width_and_value() -> impl Strategy<Value = (usize, u64)> {
    (1..=MAX_COUNTER_WIDTH).prop_flat_map(|width| (Just(width), 0..=max_value(width)))
}

/// What happens to a counter between two reconciliations
#[derive(Debug, Clone)]
enum CounterOp {
    /// The bridge applies a granted unit
    Unit,
    /// Gameplay raises the counter by some amount
    Gameplay(u8),
    /// A save reload rolls memory back to an arbitrary value
    Reload(u8),
}

fn counter_ops(max_ops: usize) -> impl Strategy<Value = Vec<CounterOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(CounterOp::Unit),
            2 => (1..10u8).prop_map(CounterOp::Gameplay),
            1 => any::<u8>().prop_map(CounterOp::Reload),
        ],
        0..max_ops,
    )
}

fn group(max_checks: u64) -> ResolvedGroup {
    ResolvedGroup {
        name: "shop".into(),
        field: CounterField {
            address: 0,
            width: 1,
            endianness: Endianness::Little,
        },
        first_location: 2001,
        max_checks,
    }
}

fn network(ids: &[u64]) -> Vec<NetworkItem> {
    ids.iter()
        .map(|&item| NetworkItem {
            item,
            location: 0,
            player: 1,
        })
        .collect()
}

// ============================================================================
// Codec
// ============================================================================

proptest! {
    #[test]
    fn counter_roundtrip((width, value) in width_and_value(), endianness in endianness_strategy()) {
        let bytes = codec::encode_counter(value, width, endianness).unwrap();
        prop_assert_eq!(bytes.len(), width);
        prop_assert_eq!(codec::decode_counter(&bytes, endianness).unwrap(), value);
    }

    /// Big and little endian encodings are byte-reversed images
    #[test]
    fn endianness_mirrors((width, value) in width_and_value()) {
        let mut le = codec::encode_counter(value, width, Endianness::Little).unwrap();
        let be = codec::encode_counter(value, width, Endianness::Big).unwrap();
        le.reverse();
        prop_assert_eq!(le, be);
    }

    #[test]
    fn overflow_is_rejected(width in 1..MAX_COUNTER_WIDTH, excess in 1..1000u64) {
        let value = max_value(width) + excess;
        prop_assert!(codec::encode_counter(value, width, Endianness::Little).is_err());
    }

    /// Setting or clearing one bit never touches the other seven
    #[test]
    fn bit_ops_touch_one_bit(byte in any::<u8>(), bit in 0..8u8, order in bit_order_strategy()) {
        let mask = codec::bit_mask(bit, order);
        let set = codec::with_bit_set(byte, bit, order);
        let cleared = codec::with_bit_cleared(byte, bit, order);

        prop_assert!(codec::is_set(set, bit, order));
        prop_assert!(!codec::is_set(cleared, bit, order));
        prop_assert_eq!(set & !mask, byte & !mask);
        prop_assert_eq!(cleared & !mask, byte & !mask);
    }

    #[test]
    fn locate_matches_index(index in 0..0x10000u32, base in 0..0x100_0000u32, order in bit_order_strategy()) {
        let loc = codec::locate(index, base, order);
        prop_assert_eq!(loc.address, base + index / 8);
        prop_assert_eq!(u32::from(loc.bit), index % 8);
    }
}

// ============================================================================
// Progress counters
// ============================================================================

proptest! {
    /// The visible value max(local, memory) never decreases, whatever
    /// gameplay and save reloads do to memory in between.
    #[test]
    fn visible_counter_value_never_decreases(ops in counter_ops(60)) {
        let field = CounterField { address: 0, width: 1, endianness: Endianness::Little };
        let mut counter = ProgressCounter::new("hearts", field);
        let mut memory: u64 = 0;
        let mut visible = 0;

        for op in ops {
            let apply = match op {
                CounterOp::Unit => true,
                CounterOp::Gameplay(n) => {
                    memory = (memory + u64::from(n)).min(255);
                    false
                }
                CounterOp::Reload(v) => {
                    memory = u64::from(v);
                    false
                }
            };

            let outcome = counter.reconcile(memory, apply);
            if let Some(value) = outcome.write() {
                memory = value;
            }

            let now = counter.value(memory);
            prop_assert!(now >= visible, "{:?} dropped {} -> {}", outcome, visible, now);
            visible = now;
        }
    }

    /// Every unit is either applied exactly once or explicitly dropped at
    /// saturation; none is silently lost while memory is stable.
    #[test]
    fn units_on_stable_memory_all_land(start in 0..200u8, units in 0..80usize) {
        let field = CounterField { address: 0, width: 1, endianness: Endianness::Little };
        let mut counter = ProgressCounter::new("hearts", field);
        let mut memory = u64::from(start);
        counter.reconcile(memory, false);

        let mut applied = 0u64;
        for _ in 0..units {
            match counter.reconcile(memory, true) {
                Reconciliation::Applied { value } => {
                    memory = value;
                    applied += 1;
                }
                Reconciliation::Saturated { .. } => {}
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
        prop_assert_eq!(memory, (u64::from(start) + units as u64).min(255));
        prop_assert_eq!(applied, memory - u64::from(start));
    }
}

// ============================================================================
// Location groups and received items
// ============================================================================

proptest! {
    /// Emitted ids are unique, inside the group, and never exceed the budget
    #[test]
    fn group_ids_unique_and_capped(
        max_checks in 1..20u64,
        seeded in 0..20u64,
        readings in prop::collection::vec(0..40u64, 1..30),
    ) {
        let group = group(max_checks);
        let mut progress = GroupProgress::new(group.clone());
        progress.seed((0..seeded).map(|unit| 2001 + unit));

        let mut seen = BTreeSet::new();
        for current in readings {
            for id in progress.advance(current) {
                prop_assert!(group.contains(id));
                prop_assert!(seen.insert(id), "{} emitted twice", id);
            }
        }
        prop_assert!(seen.len() as u64 + seeded.min(max_checks) <= max_checks);
    }

    /// Reading the same value twice emits nothing the second time
    #[test]
    fn group_advance_is_idempotent(max_checks in 1..20u64, current in 0..40u64) {
        let mut progress = GroupProgress::new(group(max_checks));
        progress.advance(current);
        prop_assert!(progress.advance(current).is_empty());
    }

    /// Applying a prefix-consistent resend never changes items already known
    #[test]
    fn received_items_prefix_stable(
        items in prop::collection::vec(1..100u64, 1..30),
        split in any::<prop::sample::Index>(),
        overlap in any::<prop::sample::Index>(),
    ) {
        let split = split.index(items.len());
        let mut received = ReceivedItems::new();
        received.apply(0, &network(&items[..split]));

        let start = overlap.index(split + 1);
        let outcome = received.apply(start, &network(&items[start..]));
        prop_assert!(!matches!(outcome, ApplyOutcome::OutOfSync { .. }), "unexpected {:?}", outcome);
        prop_assert_eq!(received.len(), items.len());
        for (i, &item) in items.iter().enumerate() {
            prop_assert_eq!(received.get(i), Some(item));
        }
    }
}
