//! Table operation errors.
//!
//! Region lifecycle failures (create/open/attach) surface as
//! `std::io::Error`; everything at the operation level is an [`Error`].
//! Mutations either commit under their final exclusive locks or restart
//! from scratch, so no error leaves the table partially updated.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Insertion attempted with no free slot left.
    #[error("table is full")]
    TableFull,

    /// Key exceeds the table's fixed key width.
    #[error("key of {len} code units exceeds the table maximum of {max}")]
    KeyTooLong { len: usize, max: usize },

    /// Value exceeds the table's fixed value width.
    #[error("value of {len} code units exceeds the table maximum of {max}")]
    ValueTooLong { len: usize, max: usize },

    /// The empty string is reserved as the empty-slot sentinel.
    #[error("keys must be non-empty")]
    InvalidKey,

    /// Lock recovery retried past its configured bound.
    #[error("gave up after {attempts} lock-recovery restarts")]
    Deadlock { attempts: u32 },
}
