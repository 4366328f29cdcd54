//! A compressed prefix tree over byte strings with ordered traversal.
//!
//! Children of a node are keyed by their edge label in a `BTreeMap`, and a
//! node's own key is always a strict prefix of its children's keys, so a
//! depth-first walk yields keys in strict ascending byte order. Edge labels
//! never share a first byte, which makes child lookup a single range probe.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

/// The tree. `V` is the stored value type.
#[derive(Debug, Clone, PartialEq)]
pub struct Radix<V> {
    root: RadixNode<V>,
    len: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct RadixNode<V> {
    value: Option<V>,
    children: BTreeMap<Vec<u8>, RadixNode<V>>,
}

impl<V> Default for Radix<V> {
    fn default() -> Self {
        Radix {
            root: RadixNode::empty(),
            len: 0,
        }
    }
}

impl<V> RadixNode<V> {
    fn empty() -> Self {
        RadixNode {
            value: None,
            children: BTreeMap::new(),
        }
    }

    fn leaf(value: V) -> Self {
        RadixNode {
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    /// Label of the child edge starting with byte `b`, if any.
    fn child_key(&self, b: u8) -> Option<Vec<u8>> {
        self.children
            .range(vec![b]..)
            .next()
            .and_then(|(label, _)| (label[0] == b).then(|| label.clone()))
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Key predicate for [`Radix::scan`]: exact key, shared prefix, or closed
/// interval (both endpoints inclusive).
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFilter {
    All,
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
    Range { lo: Vec<u8>, hi: Vec<u8> },
}

impl KeyFilter {
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(k) => key == k.as_slice(),
            KeyFilter::Prefix(p) => key.starts_with(p),
            KeyFilter::Range { lo, hi } => lo.as_slice() <= key && key <= hi.as_slice(),
        }
    }

    /// Smallest key that could match.
    pub fn lower_bound(&self) -> &[u8] {
        match self {
            KeyFilter::All => b"",
            KeyFilter::Exact(k) => k,
            KeyFilter::Prefix(p) => p,
            KeyFilter::Range { lo, .. } => lo,
        }
    }

    /// True when no match is ≥ `key`, i.e. everything from `key` on is past
    /// the filter.
    pub fn past(&self, key: &[u8]) -> bool {
        match self {
            KeyFilter::All => false,
            KeyFilter::Exact(k) => key > k.as_slice(),
            KeyFilter::Prefix(p) => key > p.as_slice() && !key.starts_with(p),
            KeyFilter::Range { hi, .. } => key > hi.as_slice(),
        }
    }

    /// Whether a subtree whose keys all start with `prefix` can contain a
    /// match.
    fn may_intersect(&self, prefix: &[u8]) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(k) => k.starts_with(prefix),
            KeyFilter::Prefix(p) => prefix.starts_with(p) || p.starts_with(prefix),
            KeyFilter::Range { lo, hi } => {
                !(prefix > hi.as_slice()
                    || (prefix < lo.as_slice() && !lo.starts_with(prefix)))
            }
        }
    }
}

impl<V> Radix<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace. Returns the previous value at the key.
    pub fn set(&mut self, key: &[u8], value: V) -> Option<V> {
        let prev = Self::insert(&mut self.root, key, value);
        if prev.is_none() {
            self.len += 1;
        }
        prev
    }

    fn insert(node: &mut RadixNode<V>, key: &[u8], value: V) -> Option<V> {
        if key.is_empty() {
            return node.value.replace(value);
        }
        let Some(label) = node.child_key(key[0]) else {
            node.children.insert(key.to_vec(), RadixNode::leaf(value));
            return None;
        };
        let common = common_prefix(&label, key);
        if common == label.len() {
            let child = node.children.get_mut(&label).expect("probed child");
            return Self::insert(child, &key[common..], value);
        }
        // The edge label and the new key diverge inside the label: split the
        // edge at the common prefix.
        let child = node.children.remove(&label).expect("probed child");
        let mut mid = RadixNode::empty();
        mid.children.insert(label[common..].to_vec(), child);
        let prev = Self::insert(&mut mid, &key[common..], value);
        node.children.insert(key[..common].to_vec(), mid);
        prev
    }

    /// Exact lookup.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut node = &self.root;
        let mut key = key;
        loop {
            if key.is_empty() {
                return node.value.as_ref();
            }
            let label = node.child_key(key[0])?;
            if !key.starts_with(&label) {
                return None;
            }
            node = node.children.get(&label)?;
            key = &key[label.len()..];
        }
    }

    /// In-order traversal of every (key, value) pair. The callback can stop
    /// the walk early by returning [`ControlFlow::Break`].
    pub fn map<F>(&self, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(&[u8], &V) -> ControlFlow<()>,
    {
        self.scan(&KeyFilter::All, f)
    }

    /// In-order traversal of the pairs matched by `filter`, pruning subtrees
    /// that cannot match.
    pub fn scan<F>(&self, filter: &KeyFilter, f: &mut F) -> ControlFlow<()>
    where
        F: FnMut(&[u8], &V) -> ControlFlow<()>,
    {
        let mut path = Vec::new();
        Self::walk(&self.root, &mut path, filter, f)
    }

    fn walk<F>(
        node: &RadixNode<V>,
        path: &mut Vec<u8>,
        filter: &KeyFilter,
        f: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&[u8], &V) -> ControlFlow<()>,
    {
        if let Some(value) = &node.value {
            if filter.matches(path) {
                f(path, value)?;
            }
        }
        for (label, child) in &node.children {
            path.extend_from_slice(label);
            if filter.may_intersect(path) {
                Self::walk(child, path, filter, f)?;
            }
            path.truncate(path.len() - label.len());
        }
        ControlFlow::Continue(())
    }

    /// Structural visit in traversal order: `(depth, edge label, value)` for
    /// every edge. This is the shape the disk encoding mirrors.
    pub fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(usize, &[u8], Option<&V>),
    {
        Self::visit_node(&self.root, 0, f)
    }

    fn visit_node<F>(node: &RadixNode<V>, depth: usize, f: &mut F)
    where
        F: FnMut(usize, &[u8], Option<&V>),
    {
        for (label, child) in &node.children {
            f(depth, label, child.value.as_ref());
            Self::visit_node(child, depth + 1, f);
        }
    }
}

impl<V: Clone> Radix<V> {
    /// All pairs in ascending key order.
    pub fn pairs(&self) -> Vec<(Vec<u8>, V)> {
        let mut out = Vec::with_capacity(self.len);
        let _ = self.map(&mut |key, value| {
            out.push((key.to_vec(), value.clone()));
            ControlFlow::Continue(())
        });
        out
    }
}
