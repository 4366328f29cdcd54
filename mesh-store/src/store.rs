//! Soul-to-file adapter: translates graph reads and writes into per-field
//! Radisk keys.
//!
//! Each field lives at the key `<soul> ENQ <field>` (ENQ = 0x05), with its
//! state stored inline next to the value. The `_` metadata of a node is
//! reconstructed on read: `_.#` is the soul itself, `_.>` comes from the
//! inline states.

use tracing::warn;

use mesh_core::types::{FieldSelector, Graph, Lex, Node, SoulKind};

use crate::radisk::{Radisk, RadiskOptions};
use crate::radix::KeyFilter;
use crate::StoreError;

/// Separates soul and field in the radisk keyspace.
pub const FIELD_SEP: char = '\u{5}';

/// The persistent store for one mesh instance. Owned by the protocol driver;
/// never shared.
#[derive(Debug)]
pub struct Store {
    radisk: Radisk,
}

impl Store {
    pub async fn open(opts: RadiskOptions) -> Result<Self, StoreError> {
        Ok(Store {
            radisk: Radisk::open(opts).await?,
        })
    }

    pub fn data_key(soul: &str, field: &str) -> String {
        format!("{soul}{FIELD_SEP}{field}")
    }

    pub fn options(&self) -> &RadiskOptions {
        self.radisk.options()
    }

    /// Stage every field of every node for the next flush.
    pub fn stage(&mut self, graph: &Graph) {
        for (soul, node) in &graph.nodes {
            for (field, value) in &node.fields {
                let key = Self::data_key(soul.as_str(), field);
                self.radisk.stage(&key, value.clone(), node.state_of(field));
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.radisk.has_pending()
    }

    pub fn batch_overflow(&self) -> bool {
        self.radisk.batch_overflow()
    }

    /// Write the staged batch out.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.radisk.flush().await
    }

    /// Assemble the subgraph matching `lex` from disk.
    ///
    /// With `secure`, fields of user-owned souls are withheld: their
    /// signatures are not persisted, so stored copies cannot be proven to a
    /// remote asker.
    pub async fn get(&mut self, lex: &Lex, secure: bool) -> Result<Option<Graph>, StoreError> {
        if secure && matches!(lex.soul.kind(), SoulKind::User { .. }) {
            return Ok(None);
        }

        let prefix = format!("{}{FIELD_SEP}", lex.soul);
        let filter = match &lex.field {
            FieldSelector::All => KeyFilter::Prefix(prefix.clone().into_bytes()),
            FieldSelector::Exact(f) => KeyFilter::Exact(format!("{prefix}{f}").into_bytes()),
            FieldSelector::Prefix(p) => KeyFilter::Prefix(format!("{prefix}{p}").into_bytes()),
            FieldSelector::Range { lo, hi } => KeyFilter::Range {
                lo: format!("{prefix}{lo}").into_bytes(),
                hi: format!("{prefix}{hi}").into_bytes(),
            },
        };

        let entries = match self.radisk.scan(&filter).await {
            Ok(entries) => entries,
            Err(err @ StoreError::Parse { .. }) => {
                // A corrupt file reads as missing data; the next write
                // rebuilds it.
                warn!(%err, "treating unreadable file as missing");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut node = Node::new(lex.soul.clone());
        for (key, entry) in entries {
            let field = &key[prefix.len()..];
            if let Some(state) = entry.state {
                node.meta.states.insert(field.to_string(), state);
            }
            node.fields.insert(field.to_string(), entry.value);
        }
        if node.fields.is_empty() {
            return Ok(None);
        }

        let mut graph = Graph::new();
        graph.nodes.insert(lex.soul.clone(), node);
        Ok(Some(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::types::{Soul, Value};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> Store {
        Store::open(RadiskOptions::new(dir.path())).await.unwrap()
    }

    fn sample() -> Graph {
        let mut graph = Graph::new();
        let soul = Soul::from("mark");
        graph.insert_field(&soul, "name", "Mark", 1.0);
        graph.insert_field(&soul, "nick", "m", 2.0);
        graph.insert_field(&soul, "boss", Value::link("amber"), 3.0);
        graph
    }

    #[tokio::test]
    async fn put_get_round_trip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        store.stage(&sample());
        store.flush().await?;

        let got = store
            .get(&Lex::field("mark", "name"), false)
            .await?
            .expect("stored");
        let node = got.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields["name"], Value::from("Mark"));
        assert_eq!(node.state_of("name"), Some(1.0));
        assert_eq!(node.fields.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn whole_node_and_relations() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        store.stage(&sample());
        store.flush().await?;

        let got = store.get(&Lex::node("mark"), false).await?.expect("stored");
        let node = got.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 3);
        assert_eq!(node.fields["boss"], Value::link("amber"));
        Ok(())
    }

    #[tokio::test]
    async fn prefix_and_range_queries() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        store.stage(&sample());
        store.flush().await?;

        let lex = Lex {
            soul: Soul::from("mark"),
            field: FieldSelector::Prefix("n".into()),
        };
        let got = store.get(&lex, false).await?.expect("stored");
        assert_eq!(got.get(&Soul::from("mark")).unwrap().fields.len(), 2);

        let lex = Lex {
            soul: Soul::from("mark"),
            field: FieldSelector::Range {
                lo: "boss".into(),
                hi: "name".into(),
            },
        };
        let got = store.get(&lex, false).await?.expect("stored");
        let node = got.get(&Soul::from("mark")).unwrap();
        assert!(node.fields.contains_key("boss"));
        assert!(node.fields.contains_key("name"));
        assert!(!node.fields.contains_key("nick"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_soul_reads_none() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        assert!(store.get(&Lex::node("nobody"), false).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn secure_withholds_user_souls() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        let mut graph = Graph::new();
        graph.insert_field(&Soul::from("~somepub"), "name", "Mark", 1.0);
        store.stage(&graph);
        store.flush().await?;

        let lex = Lex::field("~somepub", "name");
        assert!(store.get(&lex, true).await?.is_none());
        assert!(store.get(&lex, false).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn fields_do_not_leak_across_souls() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        let mut graph = Graph::new();
        graph.insert_field(&Soul::from("mark"), "name", "Mark", 1.0);
        graph.insert_field(&Soul::from("marker"), "name", "Other", 1.0);
        store.stage(&graph);
        store.flush().await?;

        let got = store.get(&Lex::node("mark"), false).await?.expect("stored");
        let node = got.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 1);
        assert_eq!(node.fields["name"], Value::from("Mark"));
        Ok(())
    }

    #[tokio::test]
    async fn tombstones_survive_the_disk() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut store = store(&dir).await;
        let mut graph = Graph::new();
        graph.insert_field(&Soul::from("mark"), "name", Value::Null, 5.0);
        store.stage(&graph);
        store.flush().await?;

        let got = store
            .get(&Lex::field("mark", "name"), false)
            .await?
            .expect("stored");
        let node = got.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields["name"], Value::Null);
        assert_eq!(node.state_of("name"), Some(5.0));
        Ok(())
    }
}
