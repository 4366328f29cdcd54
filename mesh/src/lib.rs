//! A peer-to-peer, offline-first graph database.
//!
//! Mesh synchronizes a globally-addressed key/value graph across peers with
//! end-to-end signed user data, last-writer-wins merge semantics, and
//! subscription-driven replication. Every node owns a working graph bounded
//! in memory, a packed-file store on disk, and a wire driver that routes
//! GET/PUT traffic over whatever transports it is given, picking next hops
//! by XOR distance over SHA-256 peer ids.
//!
//! ```no_run
//! use mesh::{Config, Lex, MeshNode};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let node = MeshNode::spawn(Config::new("./mesh-data")).await?;
//! node.put_field("mark", "name", "Mark").await?;
//! let found = node.get(Lex::field("mark", "name")).await?;
//! println!("{found:?}");
//! # Ok(())
//! # }
//! ```
//!
//! The crates underneath carry the moving parts: [`mesh_core`] (data model,
//! merge engine, signatures), [`mesh_store`] (radix tree and packed files),
//! [`mesh_net`] (wire protocol, routing overlay, transports).

#![deny(rustdoc::broken_intra_doc_links)]

mod config;
mod node;

pub use self::config::Config;
pub use self::node::MeshNode;

pub use mesh_core::ham::FieldChange;
pub use mesh_core::types::{
    FieldSelector, Graph, Lex, Message, Node, Relation, Soul, State, Value,
};
pub use mesh_core::{UserId, UserKeypair};
