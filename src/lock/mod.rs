// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Leases for cross-process mutual exclusion.
//!
//! The sync engine holds `sync:<installation>` for the length of a run; the
//! variance detector holds `variance:<item_code>:<session_id>` while it
//! mutates one conflict record. Leases expire on their own, so a crashed
//! holder never wedges a key, and every grant carries a fencing token that
//! storage writes can be checked against.
//!
//! Backends:
//! - [`InMemoryLockManager`]: single process
//! - [`SqlLockManager`]: `locks` table in the operational database
//! - [`RedisLockManager`]: Lua scripts over hash keys with native TTL

pub mod traits;
pub mod memory;
pub mod sql;
pub mod redis;

pub use traits::{Acquisition, Lease, LockManager, Renewal};
pub use memory::InMemoryLockManager;
pub use sql::SqlLockManager;
pub use self::redis::RedisLockManager;
