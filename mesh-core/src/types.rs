//! The graph data model: souls, values, nodes, graphs, lex queries and wire
//! messages.
//!
//! Everything here maps 1:1 onto the JSON wire encoding. A [`Node`] is a flat
//! map of field names to [`Value`]s plus the `_` metadata record carrying the
//! node's [`Soul`] and the per-field logical clocks. Edges between nodes are
//! [`Value::Link`] relations, serialized as the singleton object
//! `{"#": "<soul>"}`.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Per-field logical clock. Wall-clock milliseconds by convention.
pub type State = f64;

/// Globally unique node identifier.
#[derive(
    Debug,
    Default,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub struct Soul(String);

impl From<String> for Soul {
    fn from(s: String) -> Self {
        Soul(s)
    }
}

impl From<&str> for Soul {
    fn from(s: &str) -> Self {
        Soul(s.to_string())
    }
}

impl From<&String> for Soul {
    fn from(s: &String) -> Self {
        Soul(s.clone())
    }
}

/// Ownership class of a soul, derived from its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoulKind<'a> {
    /// Unsigned public data.
    Public,
    /// `~<pub>`: user-owned, every field requires a verifiable signature.
    User { pub_key: &'a str },
    /// `~@<alias>`: alias record, every field must reference itself.
    Alias { name: &'a str },
}

impl Soul {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kind(&self) -> SoulKind<'_> {
        if let Some(name) = self.0.strip_prefix("~@") {
            SoulKind::Alias { name }
        } else if let Some(pub_key) = self.0.strip_prefix('~') {
            SoulKind::User { pub_key }
        } else {
            SoulKind::Public
        }
    }
}

impl AsRef<str> for Soul {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A relation edge pointing at another node.
///
/// The only legal object shape for a field value. Any other object fails to
/// decode, by design: the wire model has no nested documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Relation {
    #[serde(rename = "#")]
    pub soul: Soul,
}

/// A field value: scalar or relation. `Null` doubles as the tombstone.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Link(Relation),
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => s.serialize_unit(),
            Value::Bool(b) => s.serialize_bool(*b),
            Value::Number(n) => serialize_number(n, s),
            Value::Text(t) => s.serialize_str(t),
            Value::Link(r) => r.serialize(s),
        }
    }
}

impl Value {
    pub fn link(soul: impl Into<Soul>) -> Self {
        Value::Link(Relation { soul: soul.into() })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The soul this value points at, if it is a relation.
    pub fn linked_soul(&self) -> Option<&Soul> {
        match self {
            Value::Link(r) => Some(&r.soul),
            _ => None,
        }
    }

    /// Canonical string encoding, used for the deterministic HAM tie-break.
    pub fn canon(&self) -> String {
        serde_json::to_string(self).expect("value encoding is infallible")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Integral clocks serialize as JSON integers, everything else as doubles.
fn serialize_number<S: Serializer>(n: &f64, s: S) -> Result<S::Ok, S::Error> {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0; // 2^53
    if n.fract() == 0.0 && n.abs() < MAX_SAFE {
        s.serialize_i64(*n as i64)
    } else {
        s.serialize_f64(*n)
    }
}

fn serialize_states<S: Serializer>(map: &BTreeMap<String, State>, s: S) -> Result<S::Ok, S::Error> {
    struct N(f64);
    impl Serialize for N {
        fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            serialize_number(&self.0, s)
        }
    }
    let mut m = s.serialize_map(Some(map.len()))?;
    for (k, v) in map {
        m.serialize_entry(k, &N(*v))?;
    }
    m.end()
}

/// Canonical decimal rendering of a state, shared by the signature map keys
/// and the disk encoding.
pub fn fmt_state(state: State) -> String {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if state.fract() == 0.0 && state.abs() < MAX_SAFE {
        format!("{}", state as i64)
    } else {
        format!("{state}")
    }
}

/// Node metadata: the `_` record.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// The node's own soul.
    #[serde(rename = "#", default)]
    pub soul: Soul,
    /// Per-field logical clocks.
    #[serde(rename = ">", default, serialize_with = "serialize_states")]
    pub states: BTreeMap<String, State>,
    /// Per-state detached signatures for user-owned souls, keyed by the
    /// canonical decimal rendering of the field's state.
    #[serde(rename = "s", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sigs: BTreeMap<String, String>,
}

/// A node: named fields plus metadata.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "_", default)]
    pub meta: Meta,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(soul: impl Into<Soul>) -> Self {
        Node {
            meta: Meta {
                soul: soul.into(),
                ..Default::default()
            },
            fields: Default::default(),
        }
    }

    /// Set a field together with its state.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>, state: State) {
        let field = field.into();
        self.meta.states.insert(field.clone(), state);
        self.fields.insert(field, value.into());
    }

    pub fn state_of(&self, field: &str) -> Option<State> {
        self.meta.states.get(field).copied()
    }

    /// The largest state recorded for any field, used for graph eviction.
    pub fn max_state(&self) -> State {
        self.meta
            .states
            .values()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b))
    }
}

/// A set of nodes keyed by soul.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(flatten)]
    pub nodes: BTreeMap<Soul, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, soul: &Soul) -> Option<&Node> {
        self.nodes.get(soul)
    }

    pub fn node_mut(&mut self, soul: &Soul) -> &mut Node {
        self.nodes
            .entry(soul.clone())
            .or_insert_with(|| Node::new(soul.clone()))
    }

    /// Stage one field write, creating the node as needed.
    pub fn insert_field(
        &mut self,
        soul: &Soul,
        field: impl Into<String>,
        value: impl Into<Value>,
        state: State,
    ) {
        self.node_mut(soul).set(field, value, state);
    }

    /// Build a single-node graph, the common shape for puts.
    pub fn single(
        soul: impl Into<Soul>,
        field: impl Into<String>,
        value: impl Into<Value>,
        state: State,
    ) -> Self {
        let mut g = Graph::new();
        let soul = soul.into();
        g.insert_field(&soul, field, value, state);
        g
    }
}

/// Field selector of a lex query.
#[derive(Debug, Default, Clone, PartialEq)]
pub enum FieldSelector {
    /// The whole node.
    #[default]
    All,
    /// One named field.
    Exact(String),
    /// Fields sharing a prefix.
    Prefix(String),
    /// Closed interval, both endpoints inclusive.
    Range { lo: String, hi: String },
}

/// Upper endpoint used when a wire range omits `<`.
const RANGE_MAX: &str = "\u{10FFFF}";

impl FieldSelector {
    pub fn is_all(&self) -> bool {
        matches!(self, FieldSelector::All)
    }

    pub fn matches(&self, field: &str) -> bool {
        match self {
            FieldSelector::All => true,
            FieldSelector::Exact(f) => field == f,
            FieldSelector::Prefix(p) => field.starts_with(p.as_str()),
            FieldSelector::Range { lo, hi } => lo.as_str() <= field && field <= hi.as_str(),
        }
    }
}

impl Serialize for FieldSelector {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldSelector::All => s.serialize_unit(),
            FieldSelector::Exact(f) => s.serialize_str(f),
            FieldSelector::Prefix(p) => {
                let mut m = s.serialize_map(Some(1))?;
                m.serialize_entry("*", p)?;
                m.end()
            }
            FieldSelector::Range { lo, hi } => {
                let mut m = s.serialize_map(Some(2))?;
                m.serialize_entry(">", lo)?;
                m.serialize_entry("<", hi)?;
                m.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldSelector {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            // Numeric field names are coerced to strings.
            Number(f64),
            Spec {
                #[serde(rename = "*", default)]
                prefix: Option<String>,
                #[serde(rename = ">", default)]
                lo: Option<String>,
                #[serde(rename = "<", default)]
                hi: Option<String>,
            },
        }
        Ok(match Repr::deserialize(d)? {
            Repr::Text(f) => FieldSelector::Exact(f),
            Repr::Number(n) => FieldSelector::Exact(fmt_state(n)),
            Repr::Spec {
                prefix: Some(p), ..
            } => FieldSelector::Prefix(p),
            Repr::Spec { lo, hi, .. } if lo.is_some() || hi.is_some() => FieldSelector::Range {
                lo: lo.unwrap_or_default(),
                hi: hi.unwrap_or_else(|| RANGE_MAX.to_string()),
            },
            Repr::Spec { .. } => FieldSelector::All,
        })
    }
}

/// A query: one soul plus an optional field selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lex {
    #[serde(rename = "#")]
    pub soul: Soul,
    #[serde(rename = ".", default, skip_serializing_if = "FieldSelector::is_all")]
    pub field: FieldSelector,
}

impl Lex {
    pub fn node(soul: impl Into<Soul>) -> Self {
        Lex {
            soul: soul.into(),
            field: FieldSelector::All,
        }
    }

    pub fn field(soul: impl Into<Soul>, field: impl Into<String>) -> Self {
        Lex {
            soul: soul.into(),
            field: FieldSelector::Exact(field.into()),
        }
    }
}

/// Handshake payload: the peer's stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "pub")]
    pub peer: String,
}

/// One wire message. All payload members are optional; a message may carry
/// several at once (an ACK with a `put` answers a GET with data).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Fresh random token identifying this message.
    #[serde(rename = "#", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Token of the message being answered.
    #[serde(rename = "@", default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Lex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<Graph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Message {
    /// A fresh message with a random id.
    pub fn new() -> Self {
        Message {
            id: Some(msg_id()),
            ..Default::default()
        }
    }

    /// A fresh message answering `to`.
    pub fn ack(to: &str) -> Self {
        Message {
            ack: Some(to.to_string()),
            ..Message::new()
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.as_deref().unwrap_or("-");
        let kind = if self.get.is_some() {
            "get"
        } else if self.put.is_some() {
            "put"
        } else if self.hello.is_some() {
            "hello"
        } else {
            "ack"
        };
        write!(f, "Message({id}, {kind})")
    }
}

/// Random message token: 12 alphanumeric characters.
pub fn msg_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soul_kinds() {
        assert_eq!(Soul::from("mark").kind(), SoulKind::Public);
        assert_eq!(
            Soul::from("~abcd").kind(),
            SoulKind::User { pub_key: "abcd" }
        );
        assert_eq!(
            Soul::from("~@mark").kind(),
            SoulKind::Alias { name: "mark" }
        );
    }

    #[test]
    fn value_json_round_trip() {
        let cases = [
            (Value::Null, "null"),
            (Value::Bool(true), "true"),
            (Value::Number(3.0), "3"),
            (Value::Number(3.5), "3.5"),
            (Value::from("hi"), r#""hi""#),
            (Value::link("mark"), r##"{"#":"mark"}"##),
        ];
        for (value, json) in cases {
            assert_eq!(serde_json::to_string(&value).unwrap(), json);
            let back: Value = serde_json::from_str(json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn nested_objects_are_rejected() {
        assert!(serde_json::from_str::<Value>(r#"{"x":1}"#).is_err());
        assert!(serde_json::from_str::<Value>(r##"{"#":"s","x":1}"##).is_err());
    }

    #[test]
    fn node_wire_shape() {
        let mut node = Node::new("mark");
        node.set("name", "Mark", 1.0);
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(
            json,
            r##"{"_":{"#":"mark",">":{"name":1}},"name":"Mark"}"##
        );
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn lex_wire_forms() {
        let lex: Lex = serde_json::from_str(r##"{"#":"mark",".":"name"}"##).unwrap();
        assert_eq!(lex.field, FieldSelector::Exact("name".into()));

        let lex: Lex = serde_json::from_str(r##"{"#":"mark",".":7}"##).unwrap();
        assert_eq!(lex.field, FieldSelector::Exact("7".into()));

        let lex: Lex = serde_json::from_str(r##"{"#":"mark",".":{"*":"na"}}"##).unwrap();
        assert_eq!(lex.field, FieldSelector::Prefix("na".into()));

        let lex: Lex = serde_json::from_str(r##"{"#":"mark",".":{">":"a","<":"m"}}"##).unwrap();
        assert_eq!(
            lex.field,
            FieldSelector::Range {
                lo: "a".into(),
                hi: "m".into()
            }
        );

        let lex: Lex = serde_json::from_str(r##"{"#":"mark"}"##).unwrap();
        assert_eq!(lex.field, FieldSelector::All);
    }

    #[test]
    fn range_matches_inclusive() {
        let sel = FieldSelector::Range {
            lo: "b".into(),
            hi: "d".into(),
        };
        assert!(!sel.matches("a"));
        assert!(sel.matches("b"));
        assert!(sel.matches("d"));
        assert!(!sel.matches("da"));
    }

    #[test]
    fn message_round_trip() {
        let msg: Message = serde_json::from_str(
            r##"{"#":"abc","@":"def","put":{"mark":{"_":{"#":"mark",">":{"name":1}},"name":"Mark"}}}"##,
        )
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("abc"));
        assert_eq!(msg.ack.as_deref(), Some("def"));
        let put = msg.put.as_ref().unwrap();
        let node = put.get(&Soul::from("mark")).unwrap();
        assert_eq!(node.fields["name"], Value::from("Mark"));
        assert_eq!(node.state_of("name"), Some(1.0));
    }

    #[test]
    fn state_formatting() {
        assert_eq!(fmt_state(1.0), "1");
        assert_eq!(fmt_state(1.5), "1.5");
        assert_eq!(fmt_state(-2.0), "-2");
    }
}
