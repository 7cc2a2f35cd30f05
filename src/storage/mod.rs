// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operational store backends.

pub mod traits;
pub mod memory;
pub mod sql;

pub use traits::{OperationalStore, StorageError};
pub use memory::InMemoryStore;
pub use sql::SqlStore;
