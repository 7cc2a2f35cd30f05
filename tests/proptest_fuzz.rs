//! Property-based tests (fuzzing) for inventory sync invariants.
//!
//! Uses proptest to generate random source batches, quantities, cursors
//! and malformed inputs, and checks that the pure parts of the pipeline
//! keep their guarantees and never panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use serde_json::Value;

use inventory_sync::model::compute_checksum;
use inventory_sync::sync::deduplicate;
use inventory_sync::variance::classify;
use inventory_sync::{Severity, SourceCursor, SourceRecord, VarianceStatus, VarianceThresholds};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Small code alphabet so batches contain plenty of duplicates
fn item_code_strategy() -> impl Strategy<Value = String> {
    "[A-E][0-3]"
}

fn source_record_strategy() -> impl Strategy<Value = SourceRecord> {
    (
        item_code_strategy(),
        "[a-z ]{0,12}",
        0u32..10_000,
        prop::option::of(0i64..50),
    )
        .prop_map(|(code, name, quantity, revision)| {
            let record = SourceRecord::new(code, name, f64::from(quantity));
            match revision {
                Some(r) => record.with_revision(r),
                None => record,
            }
        })
}

fn batch_strategy() -> impl Strategy<Value = Vec<SourceRecord>> {
    prop::collection::vec(source_record_strategy(), 0..64)
}

/// Quantities with at most two decimals, like real stock figures
fn quantity_strategy() -> impl Strategy<Value = f64> {
    (0u32..1_000_000).prop_map(|cents| f64::from(cents) / 100.0)
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        any::<f64>().prop_map(|f| serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::hash_map(
                prop_oneof![
                    Just("item_code".to_string()),
                    Just("name".to_string()),
                    Just("quantity".to_string()),
                    Just("revision".to_string()),
                    ".*",
                ],
                inner,
                0..8
            )
            .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Deduplication
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn dedup_leaves_one_record_per_code(batch in batch_strategy()) {
        let input_len = batch.len();
        let distinct: HashSet<String> = batch.iter().map(|r| r.item_code.clone()).collect();

        let out = deduplicate(batch);

        let codes: Vec<&str> = out.records.iter().map(|r| r.item_code.as_str()).collect();
        let unique: HashSet<&str> = codes.iter().copied().collect();
        prop_assert_eq!(codes.len(), unique.len());
        prop_assert_eq!(unique.len(), distinct.len());
        prop_assert_eq!(out.duplicates as usize, input_len - distinct.len());
    }

    #[test]
    fn dedup_keeps_highest_revision(batch in batch_strategy()) {
        let mut best: HashMap<String, Option<i64>> = HashMap::new();
        for record in &batch {
            let entry = best.entry(record.item_code.clone()).or_insert(record.revision);
            if record.revision > *entry {
                *entry = record.revision;
            }
        }

        let out = deduplicate(batch);

        for record in &out.records {
            prop_assert_eq!(record.revision, best[&record.item_code]);
        }
    }

    #[test]
    fn dedup_preserves_first_seen_order(batch in batch_strategy()) {
        let mut expected = Vec::new();
        for record in &batch {
            if !expected.contains(&record.item_code) {
                expected.push(record.item_code.clone());
            }
        }

        let out = deduplicate(batch);

        let codes: Vec<String> = out.records.into_iter().map(|r| r.item_code).collect();
        prop_assert_eq!(codes, expected);
    }

    #[test]
    fn dedup_is_idempotent(batch in batch_strategy()) {
        let once = deduplicate(batch);
        let twice = deduplicate(once.records.clone());
        prop_assert_eq!(twice.duplicates, 0);
        prop_assert_eq!(twice.records, once.records);
    }
}

// =============================================================================
// Severity classification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn severity_is_none_only_for_exact_match(
        authoritative in quantity_strategy(),
        counted in quantity_strategy(),
    ) {
        let severity = classify(Some(authoritative), counted, &VarianceThresholds::default());
        prop_assert_eq!(severity == Severity::None, authoritative == counted);
    }

    #[test]
    fn severity_grows_with_discrepancy(
        authoritative in quantity_strategy(),
        smaller in 0u32..100_000,
        extra in 0u32..100_000,
        over in any::<bool>(),
    ) {
        let thresholds = VarianceThresholds::default();
        let near = f64::from(smaller) / 100.0;
        let far = near + f64::from(extra) / 100.0;
        let counted = |delta: f64| if over { authoritative + delta } else { (authoritative - delta).max(0.0) };

        // Clamping at zero can only shrink the far delta back to the near one
        let near_severity = classify(Some(authoritative), counted(near), &thresholds);
        let far_severity = classify(Some(authoritative), counted(far), &thresholds);
        prop_assert!(far_severity >= near_severity);
    }

    #[test]
    fn severity_is_symmetric_in_direction(
        delta in 1u32..100_000,
        headroom in 0u32..100_000,
    ) {
        // Whole units keep both subtractions exact
        let thresholds = VarianceThresholds::default();
        let a = f64::from(delta + headroom);
        let d = f64::from(delta);
        prop_assert_eq!(
            classify(Some(a), a + d, &thresholds),
            classify(Some(a), a - d, &thresholds)
        );
    }

    #[test]
    fn unknown_item_is_always_critical(counted in quantity_strategy()) {
        prop_assert_eq!(
            classify(None, counted, &VarianceThresholds::default()),
            Severity::Critical
        );
    }
}

// =============================================================================
// Review state machine
// =============================================================================

fn status_strategy() -> impl Strategy<Value = VarianceStatus> {
    prop_oneof![
        Just(VarianceStatus::Open),
        Just(VarianceStatus::UnderReview),
        Just(VarianceStatus::Resolved),
        Just(VarianceStatus::Rejected),
    ]
}

proptest! {
    #[test]
    fn random_walks_stop_at_terminal_states(steps in prop::collection::vec(status_strategy(), 0..40)) {
        let mut current = VarianceStatus::Open;
        for next in steps {
            if current.can_transition_to(next) {
                prop_assert!(!current.is_terminal());
                // Terminal states are reachable only from under_review
                if next.is_terminal() {
                    prop_assert_eq!(current, VarianceStatus::UnderReview);
                }
                current = next;
            }
        }
        if current.is_terminal() {
            for next in [VarianceStatus::Open, VarianceStatus::UnderReview, VarianceStatus::Resolved, VarianceStatus::Rejected] {
                prop_assert!(!current.can_transition_to(next));
            }
        }
    }
}

// =============================================================================
// Cursors, checksums and malformed input
// =============================================================================

proptest! {
    #[test]
    fn cursor_survives_checkpoint_storage(position in any::<i64>(), code in ".*") {
        let cursor = SourceCursor::new(position, code);
        let stored = cursor.to_string();
        prop_assert_eq!(stored.parse::<SourceCursor>().unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_never_panics(text in ".*") {
        let _ = text.parse::<SourceCursor>();
    }

    #[test]
    fn checksum_depends_only_on_content(record in source_record_strategy(), revision in any::<i64>()) {
        let mut moved = record.clone().with_revision(revision);
        moved.deleted = !record.deleted;
        prop_assert_eq!(compute_checksum(&record), compute_checksum(&moved));
    }

    #[test]
    fn checksum_sees_quantity_changes(record in source_record_strategy(), bump in 1u32..1000) {
        let mut changed = record.clone();
        changed.quantity += f64::from(bump);
        prop_assert_ne!(compute_checksum(&record), compute_checksum(&changed));
    }

    #[test]
    fn validate_never_panics(code in ".{0,8}", quantity in any::<f64>(), price in any::<f64>()) {
        let record = SourceRecord::new(code.clone(), "x", quantity).with_unit_price(price);
        let valid = record.validate().is_ok();
        prop_assert_eq!(
            valid,
            !code.trim().is_empty() && quantity.is_finite() && quantity >= 0.0 && price.is_finite()
        );
    }

    #[test]
    fn arbitrary_json_never_panics_as_source_record(value in arbitrary_json_strategy()) {
        if let Ok(record) = serde_json::from_value::<SourceRecord>(value) {
            let _ = record.validate();
            let _ = record.checksum();
        }
    }
}
