//! The XOR overlay routing table.
//!
//! Peers are keyed by the SHA-256 of their stable id; distance between two
//! ids is the byte-wise XOR of their hashes, compared as a 256-bit
//! big-endian integer. Peers live in k-buckets indexed by the length of the
//! shared hash prefix with our own id. Buckets keep their oldest entries:
//! a full bucket rejects newcomers, preferring long-lived connections, per
//! Kademlia.
//!
//! The table only selects next hops; storage responsibility stays
//! subscription-driven and is never derived from keyspace proximity.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use crate::transport::ConnId;

/// Peers kept per bucket.
pub const BUCKET_SIZE: usize = 20;

/// Default fan-out for next-hop selection.
pub const DEFAULT_CLOSEST: usize = 6;

pub type IdHash = [u8; 32];

pub fn hash_id(id: &str) -> IdHash {
    Sha256::digest(id.as_bytes()).into()
}

pub fn xor_distance(a: &IdHash, b: &IdHash) -> IdHash {
    let mut out = [0u8; 32];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = a[i] ^ b[i];
    }
    out
}

/// Number of leading zero bits of a distance; 256 for the zero distance.
pub fn leading_zeros(d: &IdHash) -> u32 {
    let mut zeros = 0;
    for byte in d {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Stable id claimed in the peer's HELLO.
    pub id: String,
    /// Delivery handle: the transport connection the peer arrived on.
    pub conn: ConnId,
    hash: IdHash,
}

#[derive(Debug)]
pub struct FingerTable {
    self_id: String,
    self_hash: IdHash,
    buckets: BTreeMap<u32, Vec<PeerEntry>>,
    by_id: HashMap<String, u32>,
}

impl FingerTable {
    pub fn new(self_id: impl Into<String>) -> Self {
        let self_id = self_id.into();
        let self_hash = hash_id(&self_id);
        FingerTable {
            self_id,
            self_hash,
            buckets: BTreeMap::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Add a peer under its claimed id. Rejects ourselves and full buckets;
    /// re-adding an id replaces the old entry.
    pub fn add_peer(&mut self, id: impl Into<String>, conn: ConnId) -> bool {
        let id = id.into();
        if id == self.self_id {
            return false;
        }
        let hash = hash_id(&id);
        if hash == self.self_hash {
            return false;
        }
        self.remove_peer(&id);

        let bucket_index = leading_zeros(&xor_distance(&self.self_hash, &hash));
        let bucket = self.buckets.entry(bucket_index).or_default();
        if bucket.len() >= BUCKET_SIZE {
            return false;
        }
        bucket.push(PeerEntry { id: id.clone(), conn, hash });
        self.by_id.insert(id, bucket_index);
        true
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<PeerEntry> {
        let bucket_index = self.by_id.remove(id)?;
        let bucket = self.buckets.get_mut(&bucket_index)?;
        let at = bucket.iter().position(|p| p.id == id)?;
        let entry = bucket.remove(at);
        if bucket.is_empty() {
            self.buckets.remove(&bucket_index);
        }
        Some(entry)
    }

    pub fn get_peer(&self, id: &str) -> Option<&PeerEntry> {
        let bucket_index = self.by_id.get(id)?;
        self.buckets
            .get(bucket_index)?
            .iter()
            .find(|p| p.id == id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }

    /// The up-to-`k` known peers closest to `target` in XOR distance,
    /// ascending.
    pub fn closest(&self, target: &str, k: usize) -> Vec<&PeerEntry> {
        let target_hash = hash_id(target);
        let mut peers: Vec<&PeerEntry> = self.buckets.values().flatten().collect();
        peers.sort_by_key(|p| xor_distance(&target_hash, &p.hash));
        peers.truncate(k);
        peers
    }
}
