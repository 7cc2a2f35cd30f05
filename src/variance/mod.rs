// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Count evaluation and the variance review workflow.
//!
//! ```text
//!          begin_review            resolve
//!   open ───────────────► under_review ───────► resolved
//!     ▲                     │     │
//!     └──────── reopen ─────┘     └──────────► rejected
//!                                    reject
//! ```
//!
//! Every mutation of a variance happens under the lease
//! `variance:<item_code>:<session_id>` and is a compare-and-swap on the
//! record's revision, so two reviewers can never both win.

pub mod detector;
pub mod severity;
pub mod state;

pub use detector::{CountSubmission, DetectorError, VarianceDetector};
pub use severity::classify;
