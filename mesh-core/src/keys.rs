//! Signing primitives for user-owned souls.
//!
//! The merge engine never creates signatures itself; it only checks them.
//! This module is the seam to the crypto layer: an ed25519 keypair whose
//! public half, rendered as lowercase base32, becomes the `~<pub>` soul, and
//! detached signatures over a canonical per-field payload.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::types::{fmt_state, Node, Soul, State, Value};
use crate::Error;

/// A user's signing keypair.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserKeypair {
    key: SigningKey,
}

impl std::fmt::Debug for UserKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserKeypair({})", self.id())
    }
}

impl UserKeypair {
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        UserKeypair {
            key: SigningKey::generate(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        UserKeypair {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn id(&self) -> UserId {
        UserId(self.key.verifying_key())
    }

    /// The `~<pub>` soul owned by this keypair.
    pub fn soul(&self) -> Soul {
        Soul::from(format!("~{}", self.id()))
    }

    /// Detached signature over one field write, base64-encoded.
    pub fn sign_field(&self, soul: &Soul, field: &str, state: State, value: &Value) -> String {
        let sig = self.key.sign(&sign_payload(soul, field, state, value));
        data_encoding::BASE64.encode(&sig.to_bytes())
    }

    /// Sign every stated field of a node, filling its signature map.
    pub fn sign_node(&self, node: &mut Node) {
        let soul = node.meta.soul.clone();
        for (field, value) in &node.fields {
            if let Some(state) = node.meta.states.get(field).copied() {
                let sig = self.sign_field(&soul, field, state, value);
                node.meta.sigs.insert(fmt_state(state), sig);
            }
        }
    }
}

/// The public half of a user identity, parsed from a `~<pub>` soul.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserId(VerifyingKey);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(self.0.as_bytes());
        text.make_ascii_lowercase();
        write!(f, "{text}")
    }
}

impl std::fmt::Debug for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserId({})", hex::encode(self.0.as_bytes()))
    }
}

impl UserId {
    pub fn from_pub(text: &str) -> Result<Self, Error> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(text.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::Signature(format!("bad pub encoding: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Signature("bad pub length".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::Signature(format!("bad pub key: {e}")))?;
        Ok(UserId(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Check a detached field signature produced by [`UserKeypair::sign_field`].
    pub fn verify(
        &self,
        soul: &Soul,
        field: &str,
        state: State,
        value: &Value,
        sig: &str,
    ) -> Result<(), Error> {
        let raw = data_encoding::BASE64
            .decode(sig.as_bytes())
            .map_err(|e| Error::Signature(format!("bad signature encoding: {e}")))?;
        let sig = Signature::from_slice(&raw)
            .map_err(|e| Error::Signature(format!("bad signature: {e}")))?;
        self.0
            .verify_strict(&sign_payload(soul, field, state, value), &sig)
            .map_err(|e| Error::Signature(format!("verification failed: {e}")))
    }
}

/// Canonical signing payload: the JSON array `[soul, field, state, value]`
/// with the state rendered through [`fmt_state`] so float formatting cannot
/// drift between peers.
fn sign_payload(soul: &Soul, field: &str, state: State, value: &Value) -> Vec<u8> {
    serde_json::to_vec(&(soul.as_str(), field, fmt_state(state), value))
        .expect("payload encoding is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_field() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let soul = pair.soul();
        let value = Value::from("Mark");

        let sig = pair.sign_field(&soul, "name", 5.0, &value);
        pair.id().verify(&soul, "name", 5.0, &value, &sig).unwrap();

        // Tampering with any part of the payload must fail.
        assert!(pair.id().verify(&soul, "name", 6.0, &value, &sig).is_err());
        assert!(pair.id().verify(&soul, "nick", 5.0, &value, &sig).is_err());
        assert!(pair
            .id()
            .verify(&soul, "name", 5.0, &Value::from("Bob"), &sig)
            .is_err());
    }

    #[test]
    fn pub_text_round_trip() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let text = pair.id().to_string();
        let parsed = UserId::from_pub(&text).unwrap();
        assert_eq!(parsed, pair.id());
    }

    #[test]
    fn soul_kind_of_user_soul() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let soul = pair.soul();
        match soul.kind() {
            crate::types::SoulKind::User { pub_key } => {
                assert_eq!(pub_key, pair.id().to_string());
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn sign_node_fills_signature_map() {
        let mut rng = rand::thread_rng();
        let pair = UserKeypair::generate(&mut rng);
        let mut node = Node::new(pair.soul());
        node.set("name", "Mark", 3.0);
        node.set("age", 40.0, 4.0);
        pair.sign_node(&mut node);
        assert_eq!(node.meta.sigs.len(), 2);
        assert!(node.meta.sigs.contains_key("3"));
        assert!(node.meta.sigs.contains_key("4"));
    }
}
