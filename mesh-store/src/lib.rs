//! Radix-tree packed-file persistence for the mesh graph database.
//!
//! Three layers, bottom up:
//!
//! - [`radix`]: an in-memory compressed prefix tree with ordered traversal
//!   and lex filtering.
//! - [`radisk`]: the persistent layer — packs arbitrarily many keys into
//!   size-capped files in a directory, staging writes in a batch tree that
//!   the owner flushes on a coalesced timer.
//! - [`store`]: the soul/field adapter that the wire protocol reads and
//!   writes graphs through.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod radisk;
pub mod radix;
pub mod store;

pub use self::radisk::{Entry, Radisk, RadiskOptions};
pub use self::radix::{KeyFilter, Radix};
pub use self::store::{Store, FIELD_SEP};

/// Storage failures. I/O errors propagate to the originating caller; the
/// working graph is never rolled back on storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store file {file}: {reason}")]
    Parse { file: String, reason: String },
}
