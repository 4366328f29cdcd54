//! The listener registry: per-soul, per-field subscriptions.
//!
//! Listeners fire only for fields the merge engine actually accepted, after
//! the write has been handed to the store. Callbacks must not re-enter the
//! registry (no subscribing from inside a callback); the protocol driver
//! fires them from its own loop, so this is not a practical restriction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::ham::FieldChange;
use crate::types::{FieldSelector, Lex, Soul};

/// Callback invoked with each accepted field write.
pub type OnChange = Box<dyn Fn(&FieldChange) + Send + Sync + 'static>;

/// Handle for removing one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerToken {
    soul: Soul,
    id: u64,
}

struct Listener {
    selector: FieldSelector,
    callback: OnChange,
}

/// Subscription registry.
#[derive(Default)]
pub struct Watch {
    subs: RwLock<HashMap<Soul, HashMap<u64, Listener>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Watch({} souls)", self.subs.read().len())
    }
}

impl Watch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for the soul and field selector of `lex`.
    pub fn on(&self, lex: &Lex, callback: OnChange) -> ListenerToken {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.write().entry(lex.soul.clone()).or_default().insert(
            id,
            Listener {
                selector: lex.field.clone(),
                callback,
            },
        );
        ListenerToken {
            soul: lex.soul.clone(),
            id,
        }
    }

    /// Remove one subscription. Returns whether it was still registered.
    pub fn off(&self, token: &ListenerToken) -> bool {
        let mut subs = self.subs.write();
        let Some(listeners) = subs.get_mut(&token.soul) else {
            return false;
        };
        let removed = listeners.remove(&token.id).is_some();
        if listeners.is_empty() {
            subs.remove(&token.soul);
        }
        removed
    }

    /// Drop every subscription for a soul.
    pub fn clear(&self, soul: &Soul) {
        self.subs.write().remove(soul);
    }

    /// Whether any listener subscribes to this soul. This is what makes a
    /// peer willing to store inbound writes for it.
    pub fn contains(&self, soul: &Soul) -> bool {
        self.subs.read().contains_key(soul)
    }

    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }

    /// Fire all matching callbacks for a batch of accepted writes.
    pub fn fire(&self, changes: &[FieldChange]) {
        let subs = self.subs.read();
        for change in changes {
            let Some(listeners) = subs.get(&change.soul) else {
                continue;
            };
            for listener in listeners.values() {
                if listener.selector.matches(&change.field) {
                    (listener.callback)(change);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::sync::mpsc;

    fn change(soul: &str, field: &str, value: &str) -> FieldChange {
        FieldChange {
            soul: Soul::from(soul),
            field: field.to_string(),
            value: Value::from(value),
            state: 1.0,
        }
    }

    #[test]
    fn fires_matching_listeners_only() {
        let watch = Watch::new();
        let (tx, rx) = mpsc::channel();
        watch.on(
            &Lex::field("mark", "name"),
            Box::new(move |c| tx.send(c.clone()).unwrap()),
        );

        watch.fire(&[
            change("mark", "name", "Mark"),
            change("mark", "nick", "m"),
            change("other", "name", "x"),
        ]);

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].field, "name");
    }

    #[test]
    fn whole_node_listener_sees_every_field() {
        let watch = Watch::new();
        let (tx, rx) = mpsc::channel();
        watch.on(
            &Lex::node("mark"),
            Box::new(move |c| tx.send(c.field.clone()).unwrap()),
        );

        watch.fire(&[change("mark", "name", "Mark"), change("mark", "nick", "m")]);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got, vec!["name".to_string(), "nick".to_string()]);
    }

    #[test]
    fn off_removes_subscription() {
        let watch = Watch::new();
        let (tx, rx) = mpsc::channel();
        let token = watch.on(
            &Lex::node("mark"),
            Box::new(move |c| tx.send(c.clone()).unwrap()),
        );

        assert!(watch.contains(&Soul::from("mark")));
        assert!(watch.off(&token));
        assert!(!watch.off(&token));
        assert!(!watch.contains(&Soul::from("mark")));

        watch.fire(&[change("mark", "name", "Mark")]);
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn clear_drops_all_soul_listeners() {
        let watch = Watch::new();
        watch.on(&Lex::node("mark"), Box::new(|_| {}));
        watch.on(&Lex::field("mark", "name"), Box::new(|_| {}));
        watch.clear(&Soul::from("mark"));
        assert!(watch.is_empty());
    }
}
