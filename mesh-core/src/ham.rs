//! The HAM conflict-resolution engine.
//!
//! HAM merges incoming field writes into the working graph one (soul, field)
//! at a time, using the per-field logical clock to decide. Newer states win,
//! historical states lose, and equal states fall back to a deterministic
//! tie-break on the canonical encoding of the two values, so every honest
//! peer converges on the same graph regardless of arrival order.
//!
//! Writes dated in the future are not applied immediately: anything within
//! 24 hours is deferred and retried at its stated moment, anything beyond
//! that is dropped.

use std::cmp::Ordering;
use std::time::Duration;

use tracing::{debug, trace};

use crate::keys::UserId;
use crate::types::{fmt_state, Graph, Soul, SoulKind, State, Value};
use crate::Error;

/// Upper bound on the in-memory graph; overflowing souls are evicted
/// coldest-first.
pub const MAX_GRAPH_SIZE: usize = 10_000;

/// Writes dated further than this into the future are dropped outright.
pub const MAX_STATE_DRIFT_MS: f64 = 86_400_000.0;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> State {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time drift")
        .as_millis() as f64
}

/// Outcome of the pairwise merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HamDecision {
    /// Incoming wins; apply it.
    Take,
    /// Current wins; incoming is historical or loses the tie-break.
    Keep,
    /// States and values are identical; nothing to do.
    Same,
}

/// The per-field merge rule.
pub fn ham(
    incoming_state: State,
    current_state: State,
    incoming: &Value,
    current: &Value,
) -> HamDecision {
    if incoming_state > current_state {
        return HamDecision::Take;
    }
    if incoming_state < current_state {
        return HamDecision::Keep;
    }
    if incoming == current {
        return HamDecision::Same;
    }
    // Equal clocks, different values: the lexicographically larger canonical
    // encoding wins on every peer.
    if incoming.canon() > current.canon() {
        HamDecision::Take
    } else {
        HamDecision::Keep
    }
}

/// One accepted field write, in listener-firing form.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub soul: Soul,
    pub field: String,
    pub value: Value,
    pub state: State,
}

/// Options for [`mix`].
#[derive(Debug, Clone, Copy)]
pub struct MixOptions {
    /// Reject writes to unsigned public souls.
    pub secure: bool,
    /// The merge instant, milliseconds since the epoch.
    pub now: State,
}

impl Default for MixOptions {
    fn default() -> Self {
        MixOptions {
            secure: false,
            now: now_ms(),
        }
    }
}

/// Result of merging a change graph.
#[derive(Debug, Default)]
pub struct Merge {
    /// The subgraph actually applied; this is what gets persisted and
    /// forwarded.
    pub accepted: Graph,
    /// Future-dated fields to retry later.
    pub deferred: Graph,
    /// Delay until the earliest deferred field becomes current.
    pub wait: Option<Duration>,
    /// Accepted field writes, for the listener registry.
    pub changes: Vec<FieldChange>,
    /// Souls evicted to keep the graph within [`MAX_GRAPH_SIZE`].
    pub evicted: Vec<Soul>,
}

impl Merge {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.deferred.is_empty()
    }
}

/// Merge `change` into `graph`.
///
/// Invalid souls and fields are skipped silently (conflict-resolution
/// rejections are not errors); a node whose metadata contradicts its graph
/// key is a caller bug and raises a validation error.
pub fn mix(change: &Graph, graph: &mut Graph, opts: &MixOptions) -> Result<Merge, Error> {
    let mut out = Merge::default();

    for (soul, node) in &change.nodes {
        if node.meta.soul.is_empty() {
            trace!(%soul, "node without metadata, skipping");
            continue;
        }
        if node.meta.soul != *soul {
            return Err(Error::InvalidGraph(format!(
                "node {} keyed as {soul}",
                node.meta.soul
            )));
        }

        let verifier = match soul.kind() {
            SoulKind::User { pub_key } => {
                // A user soul that embeds a contradicting pub field is spoofed
                // as a whole.
                if let Some(Value::Text(claimed)) = node.fields.get("pub") {
                    if claimed != pub_key {
                        debug!(%soul, "pub field does not match soul, dropping");
                        continue;
                    }
                }
                match UserId::from_pub(pub_key) {
                    Ok(user) => Some(user),
                    Err(err) => {
                        debug!(%soul, %err, "unparseable user soul, dropping");
                        continue;
                    }
                }
            }
            SoulKind::Alias { .. } => None,
            SoulKind::Public => {
                if opts.secure {
                    debug!(%soul, "secure mode rejects unsigned public souls");
                    continue;
                }
                None
            }
        };

        for (field, value) in &node.fields {
            let Some(state) = node.state_of(field) else {
                trace!(%soul, field, "field without state, skipping");
                continue;
            };
            let sig = node.meta.sigs.get(&fmt_state(state));

            if let Some(user) = &verifier {
                let Some(sig) = sig else {
                    debug!(%soul, field, "unsigned field on user soul, skipping");
                    continue;
                };
                if let Err(err) = user.verify(soul, field, state, value, sig) {
                    debug!(%soul, field, %err, "signature rejected, skipping");
                    continue;
                }
            }
            if let SoulKind::Alias { .. } = soul.kind() {
                if value.linked_soul().map(Soul::as_str) != Some(field.as_str()) {
                    debug!(%soul, field, "alias field must reference itself, skipping");
                    continue;
                }
            }

            if state > opts.now + MAX_STATE_DRIFT_MS {
                trace!(%soul, field, state, "state too far in the future, dropping");
                continue;
            }
            if state > opts.now {
                let delay = Duration::from_secs_f64((state - opts.now) / 1000.0);
                out.wait = Some(out.wait.map_or(delay, |w| w.min(delay)));
                let deferred = out.deferred.node_mut(soul);
                deferred.set(field.clone(), value.clone(), state);
                if let Some(sig) = sig {
                    deferred.meta.sigs.insert(fmt_state(state), sig.clone());
                }
                continue;
            }

            let decision = match graph.get(soul).and_then(|n| n.state_of(field)) {
                None => HamDecision::Take,
                Some(current_state) => {
                    let current = graph
                        .get(soul)
                        .and_then(|n| n.fields.get(field))
                        .unwrap_or(&Value::Null);
                    ham(state, current_state, value, current)
                }
            };
            if decision != HamDecision::Take {
                trace!(%soul, field, ?decision, "write not applied");
                continue;
            }

            let node_mut = graph.node_mut(soul);
            node_mut.set(field.clone(), value.clone(), state);
            if let Some(sig) = sig {
                node_mut.meta.sigs.insert(fmt_state(state), sig.clone());
            }
            let accepted = out.accepted.node_mut(soul);
            accepted.set(field.clone(), value.clone(), state);
            if let Some(sig) = sig {
                accepted.meta.sigs.insert(fmt_state(state), sig.clone());
            }
            out.changes.push(FieldChange {
                soul: soul.clone(),
                field: field.clone(),
                value: value.clone(),
                state,
            });
        }
    }

    out.evicted = evict_overflow(graph);
    Ok(out)
}

/// Drop the souls with the smallest max state until the graph fits.
pub fn evict_overflow(graph: &mut Graph) -> Vec<Soul> {
    if graph.len() <= MAX_GRAPH_SIZE {
        return Vec::new();
    }
    let mut order: Vec<(State, Soul)> = graph
        .nodes
        .iter()
        .map(|(soul, node)| (node.max_state(), soul.clone()))
        .collect();
    order.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    let excess = graph.len() - MAX_GRAPH_SIZE;
    let evicted: Vec<Soul> = order.into_iter().take(excess).map(|(_, s)| s).collect();
    for soul in &evicted {
        graph.nodes.remove(soul);
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::UserKeypair;
    use crate::types::Node;

    fn merge_one(graph: &mut Graph, soul: &str, field: &str, value: Value, state: State) -> Merge {
        let change = Graph::single(soul, field, value, state);
        mix(
            &change,
            graph,
            &MixOptions {
                secure: false,
                now: 1_000_000.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn newer_state_wins() {
        let mut graph = Graph::new();
        merge_one(&mut graph, "mark", "name", Value::from("Alice"), 1.0);
        merge_one(&mut graph, "mark", "name", Value::from("Bob"), 2.0);

        let node = graph.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields["name"], Value::from("Bob"));
        assert_eq!(node.state_of("name"), Some(2.0));
    }

    #[test]
    fn historical_state_rejected() {
        let mut graph = Graph::new();
        merge_one(&mut graph, "mark", "name", Value::from("Bob"), 2.0);
        let merge = merge_one(&mut graph, "mark", "name", Value::from("Alice"), 1.0);

        assert!(merge.accepted.is_empty());
        let node = graph.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields["name"], Value::from("Bob"));
        assert_eq!(node.state_of("name"), Some(2.0));
    }

    #[test]
    fn equal_state_tie_breaks_lexically() {
        // Either arrival order converges on "beta".
        for (first, second) in [("alpha", "beta"), ("beta", "alpha")] {
            let mut graph = Graph::new();
            merge_one(&mut graph, "s", "x", Value::from(first), 1.0);
            merge_one(&mut graph, "s", "x", Value::from(second), 1.0);
            let node = graph.get(&Soul::from("s")).unwrap();
            assert_eq!(node.fields["x"], Value::from("beta"));
        }
    }

    #[test]
    fn equal_state_equal_value_is_noop() {
        let mut graph = Graph::new();
        merge_one(&mut graph, "s", "x", Value::from("v"), 1.0);
        let merge = merge_one(&mut graph, "s", "x", Value::from("v"), 1.0);
        assert!(merge.accepted.is_empty());
        assert!(merge.changes.is_empty());
    }

    #[test]
    fn future_write_within_drift_defers() {
        let mut graph = Graph::new();
        let merge = merge_one(&mut graph, "s", "x", Value::from("future"), 1_000_100.0);

        assert!(merge.accepted.is_empty());
        assert_eq!(merge.wait, Some(Duration::from_millis(100)));
        let deferred = merge.deferred.get(&Soul::from("s")).unwrap();
        assert_eq!(deferred.fields["x"], Value::from("future"));
        assert!(graph.get(&Soul::from("s")).is_none());
    }

    #[test]
    fn future_write_beyond_drift_drops() {
        let mut graph = Graph::new();
        let state = 1_000_000.0 + MAX_STATE_DRIFT_MS + 1.0;
        let merge = merge_one(&mut graph, "s", "x", Value::from("never"), state);
        assert!(merge.is_empty());
    }

    #[test]
    fn tombstone_applies_with_newer_state() {
        let mut graph = Graph::new();
        merge_one(&mut graph, "s", "x", Value::from("v"), 1.0);
        merge_one(&mut graph, "s", "x", Value::Null, 2.0);
        let node = graph.get(&Soul::from("s")).unwrap();
        assert_eq!(node.fields["x"], Value::Null);
    }

    #[test]
    fn user_soul_requires_valid_signature() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let soul = pair.soul();

        let mut signed = Node::new(soul.clone());
        signed.set("name", "Mark", 1.0);
        pair.sign_node(&mut signed);

        let mut change = Graph::new();
        let merged_node = change.node_mut(&soul);
        *merged_node = signed;
        merged_node.set("nick", "m", 1.0);

        let mut graph = Graph::new();
        let merge = mix(
            &change,
            &mut graph,
            &MixOptions {
                secure: true,
                now: 1_000_000.0,
            },
        )
        .unwrap();

        let node = graph.get(&soul).unwrap();
        assert_eq!(node.fields.get("name"), Some(&Value::from("Mark")));
        // The unsigned field was silently dropped.
        assert_eq!(node.fields.get("nick"), None);
        assert_eq!(merge.changes.len(), 1);
    }

    #[test]
    fn tampered_signature_is_dropped() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let soul = pair.soul();

        let mut node = Node::new(soul.clone());
        node.set("name", "Mark", 1.0);
        pair.sign_node(&mut node);
        node.fields.insert("name".into(), Value::from("Mallory"));

        let mut change = Graph::new();
        *change.node_mut(&soul) = node;

        let mut graph = Graph::new();
        let merge = mix(&change, &mut graph, &MixOptions::default()).unwrap();
        assert!(merge.is_empty());
        assert!(graph.get(&soul).is_none());
    }

    #[test]
    fn alias_field_must_reference_itself() {
        let soul = Soul::from("~@mark");
        let mut node = Node::new(soul.clone());
        node.set("~pubkey", Value::link("~pubkey"), 1.0);
        node.set("other", Value::link("elsewhere"), 1.0);

        let mut change = Graph::new();
        *change.node_mut(&soul) = node;

        let mut graph = Graph::new();
        mix(&change, &mut graph, &MixOptions::default()).unwrap();

        let node = graph.get(&soul).unwrap();
        assert!(node.fields.contains_key("~pubkey"));
        assert!(!node.fields.contains_key("other"));
    }

    #[test]
    fn secure_mode_rejects_public_souls() {
        let mut graph = Graph::new();
        let change = Graph::single("plain", "x", Value::from("v"), 1.0);
        let merge = mix(
            &change,
            &mut graph,
            &MixOptions {
                secure: true,
                now: 1_000_000.0,
            },
        )
        .unwrap();
        assert!(merge.is_empty());
        assert!(graph.is_empty());
    }

    #[test]
    fn mislabeled_node_is_a_validation_error() {
        let mut change = Graph::new();
        let mut node = Node::new("other");
        node.set("x", "v", 1.0);
        change.nodes.insert(Soul::from("s"), node);

        let mut graph = Graph::new();
        assert!(mix(&change, &mut graph, &MixOptions::default()).is_err());
    }

    #[test]
    fn overflow_evicts_coldest_souls() {
        let mut graph = Graph::new();
        for i in 0..(MAX_GRAPH_SIZE + 5) {
            // Soul "s0" is coldest, "s1" next, and so on.
            graph.insert_field(
                &Soul::from(format!("s{i}")),
                "x",
                Value::Number(i as f64),
                i as f64 + 1.0,
            );
        }
        let evicted = evict_overflow(&mut graph);
        assert_eq!(evicted.len(), 5);
        assert_eq!(graph.len(), MAX_GRAPH_SIZE);
        assert!(graph.get(&Soul::from("s0")).is_none());
        assert!(graph.get(&Soul::from("s4")).is_none());
        assert!(graph.get(&Soul::from("s5")).is_some());
    }
}
