//! The node facade: storage, transports and the protocol driver wired
//! together behind one handle.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use mesh_core::ham::{now_ms, FieldChange};
use mesh_core::types::{Graph, Lex, Node, Value};
use mesh_core::watch::ListenerToken;
use mesh_core::UserKeypair;
use mesh_net::transport::{connect_memory, connect_tcp, listen_tcp};
use mesh_net::wire::Wire;
use mesh_store::Store;

use crate::Config;

/// One mesh instance: an owned working graph, a store directory, and any
/// number of transports. Instances in the same process share nothing and
/// must not share store directories.
#[derive(Debug)]
pub struct MeshNode {
    wire: Wire,
    keypair: UserKeypair,
    peer_id: String,
    listen_addr: Option<SocketAddr>,
    _listener: Option<JoinHandle<()>>,
}

impl MeshNode {
    /// Open the store, spawn the driver, and bring up the configured
    /// transports.
    pub async fn spawn(config: Config) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let keypair = UserKeypair::generate(&mut rng);
        let peer_id = config
            .peer_id
            .clone()
            .unwrap_or_else(|| keypair.id().to_string());

        let store = Store::open(config.radisk_options()).await?;
        let wire = Wire::spawn(config.wire_config(peer_id.clone()), store);

        let (listen_addr, listener) = match config.port {
            Some(port) => {
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                let (local, handle) = listen_tcp(addr, wire.connections()).await?;
                (Some(local), Some(handle))
            }
            None => (None, None),
        };

        for peer in &config.peers {
            if let Err(err) = connect_tcp(peer, wire.connections()).await {
                // Startup keeps going; the caller can re-dial later.
                warn!(%peer, %err, "failed to dial upstream peer");
            }
        }

        Ok(MeshNode {
            wire,
            keypair,
            peer_id,
            listen_addr,
            _listener: listener,
        })
    }

    /// This node's stable peer id, as sent in HELLO.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The node's own user keypair, for `~pub` writes.
    pub fn keypair(&self) -> &UserKeypair {
        &self.keypair
    }

    /// Bound server address, when a `port` was configured.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Resolve a lex query: graph, store, then network. `Ok(None)` is
    /// not-found.
    pub async fn get(&self, lex: Lex) -> Result<Option<Graph>> {
        self.wire.get(lex).await
    }

    /// Merge a change graph, persist it, and broadcast it.
    pub async fn put(&self, graph: Graph) -> Result<()> {
        self.wire.put(graph).await
    }

    /// Write one field of one soul, stamped with the current wall clock.
    pub async fn put_field(
        &self,
        soul: impl Into<mesh_core::Soul>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.put(Graph::single(soul, field, value, now_ms())).await
    }

    /// Sign a node with this node's keypair and put it. The node's soul
    /// defaults to the keypair's `~pub` soul.
    pub async fn put_signed(&self, mut node: Node) -> Result<()> {
        if node.meta.soul.is_empty() {
            node.meta.soul = self.keypair.soul();
        }
        self.keypair.sign_node(&mut node);
        let mut graph = Graph::new();
        let soul = node.meta.soul.clone();
        graph.nodes.insert(soul, node);
        self.put(graph).await
    }

    /// Subscribe to accepted writes matching `lex`. With `fetch`, existing
    /// data is delivered immediately and a GET is issued upstream.
    pub async fn subscribe(
        &self,
        lex: Lex,
        fetch: bool,
    ) -> Result<(ListenerToken, mpsc::Receiver<FieldChange>)> {
        self.wire.subscribe(lex, fetch).await
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, token: ListenerToken) -> Result<bool> {
        self.wire.unsubscribe(token).await
    }

    /// Drop every subscription for a soul.
    pub async fn unsubscribe_all(&self, soul: impl Into<mesh_core::Soul>) -> Result<()> {
        self.wire.unsubscribe_all(soul.into()).await
    }

    /// Number of live transport connections.
    pub async fn peer_count(&self) -> Result<usize> {
        self.wire.peer_count().await
    }

    /// Connect to another in-process node over the memory transport.
    pub async fn connect(&self, other: &MeshNode) -> Result<()> {
        connect_memory(&self.wire.connections(), &other.wire.connections()).await?;
        Ok(())
    }

    /// Flush the store and stop the driver.
    pub async fn shutdown(&self) -> Result<()> {
        self.wire.shutdown().await
    }
}
