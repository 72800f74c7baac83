//! Repository implementations for herald.
//!
//! [`MemoryStore`] keeps everything behind one lock and is used by tests and
//! the `memory` backend. [`SqliteStore`] persists to a single SQLite file and
//! applies milestone writes as versioned conditional updates.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
