// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::config::VarianceThresholds;
use crate::model::Severity;

/// Below this a delta is treated as an exact match.
pub(crate) const QUANTITY_EPSILON: f64 = 1e-9;

/// Classify a count against the authoritative quantity.
///
/// First match wins: unknown item, critical, major, then minor. A level
/// matches when `|delta| / max(authoritative, 1)` reaches its ratio *and*
/// `|delta|` reaches its absolute amount. A zero delta is `None`.
///
/// ```
/// use inventory_sync::config::VarianceThresholds;
/// use inventory_sync::model::Severity;
/// use inventory_sync::variance::classify;
///
/// let t = VarianceThresholds::default();
/// assert_eq!(classify(Some(100.0), 70.0, &t), Severity::Major);
/// assert_eq!(classify(Some(50.0), 45.0, &t), Severity::Minor);
/// assert_eq!(classify(None, 3.0, &t), Severity::Critical);
/// ```
pub fn classify(authoritative: Option<f64>, counted: f64, thresholds: &VarianceThresholds) -> Severity {
    let Some(authoritative) = authoritative else {
        return Severity::Critical;
    };

    let delta = (counted - authoritative).abs();
    if delta < QUANTITY_EPSILON {
        return Severity::None;
    }

    let ratio = delta / authoritative.max(1.0);
    if ratio >= thresholds.critical_ratio && delta >= thresholds.critical_absolute {
        Severity::Critical
    } else if ratio >= thresholds.major_ratio && delta >= thresholds.major_absolute {
        Severity::Major
    } else {
        Severity::Minor
    }
}
