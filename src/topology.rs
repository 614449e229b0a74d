//! Cluster membership and the consistent-hashing helpers derived from it.
//!
//! Each node has a fixed 64-bit signature with a small, fixed Hamming
//! weight (its "point" on the ring). A timer's bloom hash is the bitwise OR
//! of the signatures of its replicas; any node can recover a superset of
//! the replica set from the hash alone (§3, §4.1).

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One cluster member as seen in the config file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    /// `host:port`, also this node's identity in `Timer::replicas`.
    pub addr: String,
    /// 64-bit consistent-hash signature, `bloom_bits` bits set.
    pub signature: u64,
}

/// An immutable snapshot of cluster membership plus local identity.
/// Reload swaps this whole struct behind an `Arc`; nothing here is ever
/// mutated in place (§9 "Global configuration").
#[derive(Debug, Clone)]
pub struct Topology {
    pub local: NodeInfo,
    /// All nodes, including `local`, in deterministic (config file) order.
    pub nodes: Vec<NodeInfo>,
    pub bloom_bits: u32,
    pub default_replication_factor: usize,
}

/// A hot-swappable snapshot: readers clone the inner `Arc<Topology>` and
/// keep using it even if a config reload installs a new one mid-request
/// (§9 "Global configuration").
pub type TopologyHandle = Arc<RwLock<Arc<Topology>>>;

impl Topology {
    pub fn local_addr(&self) -> &str {
        &self.local.addr
    }

    pub fn node(&self, addr: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.addr == addr)
    }

    /// OR of the signatures of the named nodes. Unknown addresses
    /// contribute nothing (best-effort, per §9's open question on
    /// explicit replicas outside the current cluster).
    pub fn bloom_hash_of<'a>(&self, addrs: impl IntoIterator<Item = &'a str>) -> u64 {
        addrs.into_iter().fold(0u64, |acc, addr| {
            acc | self.node(addr).map(|n| n.signature).unwrap_or(0)
        })
    }

    /// §4.1 step 2: nodes whose full signature is contained in `bloom_hash`.
    /// Deterministic cluster order, so callers can simply `.take(r)`.
    pub fn candidates_for_hash(&self, bloom_hash: u64) -> Vec<&NodeInfo> {
        if bloom_hash == 0 {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter(|n| n.signature != 0 && (n.signature & bloom_hash) == n.signature)
            .collect()
    }

    /// §4.1 step 3: consistent-hash ring walk seeded by the timer id,
    /// skipping nodes already chosen, until `want` are picked or the
    /// cluster is exhausted.
    pub fn ring_walk(&self, timer_id: u64, exclude: &HashSet<&str>, want: usize) -> Vec<&NodeInfo> {
        let mut ordered: Vec<&NodeInfo> = self
            .nodes
            .iter()
            .filter(|n| !exclude.contains(n.addr.as_str()))
            .collect();
        ordered.sort_by_key(|n| ring_distance(timer_id, &n.addr));
        ordered.into_iter().take(want).collect()
    }

    /// Full replica selection algorithm from §4.1, given that the caller
    /// has already established that no explicit replica list was supplied.
    pub fn select_replicas(&self, timer_id: u64, bloom_hash: u64, replication_factor: usize) -> Vec<String> {
        let mut chosen: Vec<String> = self
            .candidates_for_hash(bloom_hash)
            .into_iter()
            .take(replication_factor)
            .map(|n| n.addr.clone())
            .collect();

        if chosen.len() < replication_factor {
            let exclude: HashSet<&str> = chosen.iter().map(String::as_str).collect();
            let need = replication_factor - chosen.len();
            for n in self.ring_walk(timer_id, &exclude, need) {
                chosen.push(n.addr.clone());
            }
        }
        chosen
    }

    /// A node's signature has `bloom_bits` bits set, deterministically
    /// derived from its address so the whole cluster can agree on it
    /// without a side channel. Config normally supplies explicit
    /// signatures; this is used to mint one for a node the config omits.
    pub fn derive_signature(addr: &str, bloom_bits: u32) -> u64 {
        let bloom_bits = bloom_bits.min(64);
        let mut sig = 0u64;
        let mut seed = fnv1a(addr.as_bytes());
        let mut set = 0u32;
        while set < bloom_bits {
            let bit = (seed % 64) as u32;
            if sig & (1 << bit) == 0 {
                sig |= 1 << bit;
                set += 1;
            }
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        }
        sig
    }
}

/// Ring distance used by the consistent-hash fallback: nodes closer (by
/// this pseudo-distance) to the timer id are preferred. Not cryptographic;
/// just needs to be stable and roughly uniform.
fn ring_distance(timer_id: u64, addr: &str) -> u64 {
    fnv1a(addr.as_bytes()) ^ timer_id
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes.iter().fold(OFFSET, |mut hash, &b| {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
        hash
    })
}
