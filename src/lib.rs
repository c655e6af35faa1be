//! weft-map: a shared-memory, fixed-capacity, coalesced-chaining string
//! map.
//!
//! One flat byte region — a named mmap file or an anonymous mapping —
//! holds the whole table: header, per-slot lock words, and inline UTF-16
//! key/value storage. Any number of threads or attached processes read
//! and write it concurrently through fine-grained per-slot locks, with a
//! global gate for write lockout and chain surgery, and bounded-timeout
//! deadlock recovery on the insert path.
//!
//! Capacity, key width and value width are fixed at construction.
//! Collisions are resolved by coalesced chaining inside the table
//! itself; deletions rechain so that surviving entries stay reachable
//! from their home slot.
//!
//! ```no_run
//! use weft_map::{SharedTable, TableOptions};
//!
//! let table = SharedTable::create("demo", &TableOptions::default())?;
//! table.set("answer", "42")?;
//! assert_eq!(table.get("answer").as_deref(), Some("42"));
//!
//! // A peer (thread or process) attaches to the same region by name.
//! let peer = SharedTable::open("demo")?;
//! assert!(peer.has("answer"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod hash;
mod shm;

pub use error::Error;
pub use hash::{murmur2, KeyHashFn};
pub use shm::{Keys, SharedTable, TableOptions, WriteGuard};
