//! Wire protocol, routing overlay and transports for the mesh graph
//! database.
//!
//! The [`wire::Wire`] driver binds everything together: it deduplicates and
//! rate-limits inbound traffic ([`dup`], [`limit`]), answers GETs from the
//! working graph and the store, merges subscription-filtered PUTs through
//! the HAM engine, and routes outbound messages to the XOR-closest peers
//! known to the [`finger`] table, falling back to broadcast. Transports
//! ([`transport`]) are plain framed connections; peer identity travels
//! in-band in the HELLO message.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod dup;
pub mod finger;
pub mod limit;
pub mod transport;
pub mod util;
pub mod wire;

pub use self::dup::Dup;
pub use self::finger::{FingerTable, BUCKET_SIZE, DEFAULT_CLOSEST};
pub use self::limit::{Decision, RateLimiter};
pub use self::transport::{
    connect_memory, connect_tcp, listen_tcp, ConnEvent, ConnId, MAX_FRAME_SIZE,
};
pub use self::wire::{Wire, WireConfig};
