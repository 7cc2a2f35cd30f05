// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed records for the operational store.
//!
//! The store is treated as plain serialization: every collection has an
//! explicit record type here, and enum-valued columns round-trip through
//! [`FromStr`] so a malformed row is rejected at the read boundary instead of
//! leaking into the engine.
//!
//! # Example
//!
//! ```
//! use inventory_sync::model::{SourceRecord, VarianceStatus};
//!
//! let record = SourceRecord::new("X100", "Hex bolt M8", 50.0);
//! let item = record.to_item(1_700_000_000_000);
//! assert_eq!(item.item_code, "X100");
//! assert_eq!(item.source_checksum, record.checksum());
//!
//! assert_eq!("under_review".parse::<VarianceStatus>(), Ok(VarianceStatus::UnderReview));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Error returned when a stored enum string is not a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

/// Snapshot of one item as last imported from the authoritative source.
///
/// Written only by the sync engine; count submissions never touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeItem {
    pub item_code: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Epoch millis of the sync run that last wrote this record
    pub last_synced_at: i64,
    /// Opaque checksum of the source row; unchanged checksum means no write
    pub source_checksum: String,
}

/// One row as returned by a [`crate::source::SourceReader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub item_code: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Source-side revision, used to pick the canonical row among duplicates
    #[serde(default)]
    pub revision: Option<i64>,
    /// Checksum supplied by the source; computed from the fields when absent
    #[serde(default)]
    pub source_checksum: Option<String>,
    /// Explicit deletion signal from the source
    #[serde(default)]
    pub deleted: bool,
}

impl SourceRecord {
    /// Create a record with the required fields; everything else defaults.
    pub fn new(item_code: impl Into<String>, name: impl Into<String>, quantity: f64) -> Self {
        Self {
            item_code: item_code.into(),
            name: name.into(),
            quantity,
            unit_price: 0.0,
            category: None,
            location: None,
            revision: None,
            source_checksum: None,
            deleted: false,
        }
    }

    #[must_use]
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = Some(revision);
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.source_checksum = Some(checksum.into());
        self
    }

    #[must_use]
    pub fn with_unit_price(mut self, unit_price: f64) -> Self {
        self.unit_price = unit_price;
        self
    }

    #[must_use]
    pub fn with_location(mut self, category: Option<&str>, location: Option<&str>) -> Self {
        self.category = category.map(String::from);
        self.location = location.map(String::from);
        self
    }

    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// The checksum used for no-op detection.
    pub fn checksum(&self) -> String {
        self.source_checksum
            .clone()
            .unwrap_or_else(|| compute_checksum(self))
    }

    /// Reject rows that cannot be stored as an [`AuthoritativeItem`].
    pub fn validate(&self) -> Result<(), String> {
        if self.item_code.trim().is_empty() {
            return Err("empty item_code".to_string());
        }
        if !self.quantity.is_finite() || self.quantity < 0.0 {
            return Err(format!("invalid quantity {} for '{}'", self.quantity, self.item_code));
        }
        if !self.unit_price.is_finite() {
            return Err(format!("invalid unit_price for '{}'", self.item_code));
        }
        Ok(())
    }

    pub fn to_item(&self, synced_at: i64) -> AuthoritativeItem {
        AuthoritativeItem {
            item_code: self.item_code.clone(),
            name: self.name.clone(),
            quantity: self.quantity,
            unit_price: self.unit_price,
            category: self.category.clone(),
            location: self.location.clone(),
            last_synced_at: synced_at,
            source_checksum: self.checksum(),
        }
    }
}

/// SHA-256 over the item fields, separated by the ASCII unit separator.
pub fn compute_checksum(record: &SourceRecord) -> String {
    let mut hasher = Sha256::new();
    for part in [
        record.item_code.as_str(),
        record.name.as_str(),
        &record.quantity.to_string(),
        &record.unit_price.to_string(),
        record.category.as_deref().unwrap_or(""),
        record.location.as_deref().unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

string_enum!(SessionStatus, "session status", { Open => "open", Closed => "closed" });

/// A counting session; counts are only accepted while it is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountStatus {
    Pending,
    Verified,
    Flagged,
}

string_enum!(CountStatus, "count status", {
    Pending => "pending",
    Verified => "verified",
    Flagged => "flagged",
});

/// A user's physical count of one item within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountEntry {
    pub session_id: String,
    pub item_code: String,
    pub counted_quantity: f64,
    pub counted_by: String,
    pub counted_at: i64,
    pub status: CountStatus,
}

impl CountEntry {
    pub fn new(
        session_id: impl Into<String>,
        item_code: impl Into<String>,
        counted_quantity: f64,
        counted_by: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            item_code: item_code.into(),
            counted_quantity,
            counted_by: counted_by.into(),
            counted_at: now_millis(),
            status: CountStatus::Pending,
        }
    }
}

/// Variance severity. Ordered so that `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Minor,
    Major,
    Critical,
}

string_enum!(Severity, "severity", {
    None => "none",
    Minor => "minor",
    Major => "major",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceStatus {
    Open,
    UnderReview,
    Resolved,
    Rejected,
}

string_enum!(VarianceStatus, "variance status", {
    Open => "open",
    UnderReview => "under_review",
    Resolved => "resolved",
    Rejected => "rejected",
});

/// Discrepancy between the authoritative quantity and a counted quantity.
///
/// Keyed by `(item_code, session_id)`; kept forever for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceRecord {
    pub item_code: String,
    pub session_id: String,
    /// `None` when the item is unknown to the authoritative source
    pub authoritative_quantity: Option<f64>,
    pub counted_quantity: f64,
    pub delta: f64,
    pub severity: Severity,
    pub status: VarianceStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    /// Bumped on every write; updates compare against it
    pub revision: u64,
}

impl VarianceRecord {
    /// Lease key guarding mutations of this record.
    pub fn lease_key(item_code: &str, session_id: &str) -> String {
        format!("variance:{}:{}", item_code, session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

string_enum!(RunStatus, "run status", {
    Running => "running",
    Success => "success",
    Failed => "failed",
});

/// Durable import progress; one per installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub installation_id: String,
    pub last_run_at: Option<i64>,
    /// Opaque [`crate::source::SourceCursor`] string
    pub last_cursor: Option<String>,
    pub items_processed: u64,
    pub run_status: RunStatus,
    /// Token of the sync lease that last wrote this checkpoint
    pub fencing_token: u64,
}

impl SyncCheckpoint {
    /// A checkpoint for an installation that has never synced.
    pub fn initial(installation_id: impl Into<String>) -> Self {
        Self {
            installation_id: installation_id.into(),
            last_run_at: None,
            last_cursor: None,
            items_processed: 0,
            run_status: RunStatus::Success,
            fencing_token: 0,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied
    Applied,
    /// A precondition failed (record exists, revision moved, or fenced)
    Conflict,
}

impl WriteOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
