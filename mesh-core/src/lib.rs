//! Data model and conflict resolution for the mesh graph database.
//!
//! The crate operates on a [Graph]: a set of [nodes](types::Node) keyed by
//! globally unique string [souls](types::Soul), whose fields hold scalars or
//! [relations](types::Relation) pointing at other nodes. Every field carries
//! a logical clock, and the [HAM merge engine](ham) resolves concurrent
//! writes with last-writer-wins semantics and a deterministic tie-break, so
//! peers that observe the same writes converge on byte-equal graphs.
//!
//! User-owned souls (`~<pub>`) are gated on detached [ed25519
//! signatures](keys); alias souls (`~@name`) must self-reference. Local
//! reads go through [lex queries](types::Lex) resolved by [get::query], and
//! accepted writes drive the [listener registry](watch::Watch).

#![deny(rustdoc::broken_intra_doc_links)]

pub mod get;
pub mod ham;
pub mod keys;
pub mod types;
pub mod watch;

pub use self::ham::{ham, mix, FieldChange, HamDecision, Merge, MixOptions};
pub use self::keys::{UserId, UserKeypair};
pub use self::types::{
    FieldSelector, Graph, Hello, Lex, Message, Meta, Node, Relation, Soul, SoulKind, State, Value,
};
pub use self::watch::{ListenerToken, Watch};

/// Errors raised by the core engine. Conflict-resolution rejections are not
/// errors; they silently drop the offending field or soul.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Ill-typed lex query.
    #[error("invalid lex query: {0}")]
    InvalidLex(String),
    /// Ill-typed change or graph.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// Malformed key or signature material.
    #[error("signature rejected: {0}")]
    Signature(String),
    /// A write tried to re-claim an existing user soul with a different key.
    #[error("user identity mismatch for {0}")]
    PubMismatch(Soul),
}
