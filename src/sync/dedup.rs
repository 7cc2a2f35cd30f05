// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use tracing::warn;

use crate::model::SourceRecord;

/// One canonical record per item code.
#[derive(Debug, Default)]
pub struct Deduplicated {
    /// In first-seen order of their item codes
    pub records: Vec<SourceRecord>,
    /// Rows dropped in favour of a canonical one
    pub duplicates: u64,
}

/// Collapse rows sharing an item code.
///
/// The row with the highest source revision wins; a row with a revision
/// beats one without; otherwise the first-seen row is kept.
pub fn deduplicate(records: Vec<SourceRecord>) -> Deduplicated {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut result = Deduplicated {
        records: Vec::with_capacity(records.len()),
        duplicates: 0,
    };

    for record in records {
        match index.get(&record.item_code) {
            None => {
                index.insert(record.item_code.clone(), result.records.len());
                result.records.push(record);
            }
            Some(&slot) => {
                result.duplicates += 1;
                let kept = &mut result.records[slot];
                warn!(
                    item_code = %record.item_code,
                    kept_revision = ?kept.revision,
                    other_revision = ?record.revision,
                    "Duplicate item code in source batch"
                );
                if supersedes(&record, kept) {
                    *kept = record;
                }
            }
        }
    }

    result
}

fn supersedes(candidate: &SourceRecord, kept: &SourceRecord) -> bool {
    match (candidate.revision, kept.revision) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    }
}
