//! Local lex queries against the in-memory graph.

use crate::types::{fmt_state, FieldSelector, Graph, Lex, Node};

/// Resolve `lex` against `graph`.
///
/// Returns the matching subgraph with the node's state map restricted to the
/// matched fields, or `None` when the graph cannot satisfy the query. With
/// `fast` the node is returned even when no field matched, so callers that
/// tolerate partial data can use what is already loaded.
pub fn query(lex: &Lex, graph: &Graph, fast: bool) -> Option<Graph> {
    let node = graph.get(&lex.soul)?;

    let mut out = Node::new(lex.soul.clone());
    for (field, value) in &node.fields {
        if !lex.field.matches(field) {
            continue;
        }
        out.fields.insert(field.clone(), value.clone());
        if let Some(state) = node.state_of(field) {
            out.meta.states.insert(field.clone(), state);
            if let Some(sig) = node.meta.sigs.get(&fmt_state(state)) {
                out.meta.sigs.insert(fmt_state(state), sig.clone());
            }
        }
    }

    if out.fields.is_empty() && !fast && !matches!(lex.field, FieldSelector::All) {
        return None;
    }

    let mut sub = Graph::new();
    sub.nodes.insert(lex.soul.clone(), out);
    Some(sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Soul, Value};

    fn sample() -> Graph {
        let mut graph = Graph::new();
        let soul = Soul::from("mark");
        graph.insert_field(&soul, "name", "Mark", 1.0);
        graph.insert_field(&soul, "nick", "m", 2.0);
        graph.insert_field(&soul, "age", 40.0, 3.0);
        graph
    }

    #[test]
    fn exact_field() {
        let graph = sample();
        let sub = query(&Lex::field("mark", "name"), &graph, false).unwrap();
        let node = sub.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 1);
        assert_eq!(node.fields["name"], Value::from("Mark"));
        assert_eq!(node.meta.states.len(), 1);
        assert_eq!(node.state_of("name"), Some(1.0));
    }

    #[test]
    fn missing_field_is_none() {
        let graph = sample();
        assert!(query(&Lex::field("mark", "missing"), &graph, false).is_none());
        // fast returns the (empty) subset anyway
        assert!(query(&Lex::field("mark", "missing"), &graph, true).is_some());
    }

    #[test]
    fn missing_soul_is_none() {
        let graph = sample();
        assert!(query(&Lex::node("nobody"), &graph, false).is_none());
    }

    #[test]
    fn whole_node() {
        let graph = sample();
        let sub = query(&Lex::node("mark"), &graph, false).unwrap();
        let node = sub.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 3);
    }

    #[test]
    fn prefix_subset() {
        let graph = sample();
        let lex = Lex {
            soul: Soul::from("mark"),
            field: FieldSelector::Prefix("n".into()),
        };
        let sub = query(&lex, &graph, false).unwrap();
        let node = sub.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 2);
        assert!(node.fields.contains_key("name"));
        assert!(node.fields.contains_key("nick"));
    }

    #[test]
    fn range_subset_is_inclusive() {
        let graph = sample();
        let lex = Lex {
            soul: Soul::from("mark"),
            field: FieldSelector::Range {
                lo: "age".into(),
                hi: "name".into(),
            },
        };
        let sub = query(&lex, &graph, false).unwrap();
        let node = sub.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields.len(), 2);
        assert!(node.fields.contains_key("age"));
        assert!(node.fields.contains_key("name"));
        assert!(!node.fields.contains_key("nick"));
    }
}
