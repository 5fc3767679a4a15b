//! Provides the consistent hash ring which assigns cache keys to cluster members.
//!
//! Each registered peer is placed on the ring as a configurable number of virtual nodes. This
//! trades a bit of memory for a much smoother key distribution across small clusters: with only
//! a handful of real peers, a single hash per peer would carve the hash space into wildly uneven
//! arcs, whereas a few dozen virtual nodes per peer even things out nicely.
//!
//! Looking up the owner of a key walks the ring clockwise: we hash the key and pick the peer
//! owning the first virtual node at or after that hash, wrapping around to the smallest virtual
//! node if the key hashes beyond the largest one. As long as neither the peer set nor the hash
//! function change, this assignment is fully deterministic.
//!
//! Note that the ring is add-only. Shrinking the peer set means building a fresh ring from the
//! remaining peers, which is exactly what [HttpPool::set_peers](crate::http::HttpPool::set_peers)
//! does on every update.
//!
//! # Examples
//!
//! ```
//! # use callisto::ring::Ring;
//! let mut ring = Ring::new(50);
//! ring.add(&["http://10.0.0.1:2410", "http://10.0.0.2:2410"]);
//!
//! // A key is always owned by the same peer...
//! let owner = ring.get("some-key").unwrap().to_owned();
//! assert_eq!(ring.get("some-key").unwrap(), owner);
//! ```
use fnv::{FnvHasher, FnvHashMap};
use std::hash::Hasher;

/// Maps a byte sequence to a position on the ring.
///
/// The hash function is pluggable so that tests can inject a deterministic stub and reason
/// about the exact ring layout.
pub type HashFn = fn(&[u8]) -> u32;

/// Computes the default ring position of the given bytes (FNV-1a, truncated to 32 bits).
fn fnv32(data: &[u8]) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish() as u32
}

/// Maps string keys to the registered peer owning them.
///
/// See the module documentation for an overview of the algorithm.
pub struct Ring {
    replicas: usize,
    hash: HashFn,
    keys: Vec<u32>,
    peers: FnvHashMap<u32, String>,
}

impl Ring {
    /// Creates an empty ring which places each peer as **replicas** virtual nodes.
    pub fn new(replicas: usize) -> Self {
        Ring::with_hash(replicas, fnv32)
    }

    /// Creates an empty ring using the given hash function.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callisto::ring::Ring;
    /// // Using a stub hash makes the ring layout fully predictable...
    /// let mut ring = Ring::with_hash(1, |data| {
    ///     std::str::from_utf8(data).unwrap()[1..].parse().unwrap()
    /// });
    /// ring.add(&["10", "20"]);
    ///
    /// assert_eq!(ring.get("x5").unwrap(), "10");
    /// assert_eq!(ring.get("x15").unwrap(), "20");
    /// assert_eq!(ring.get("x25").unwrap(), "10");
    /// ```
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        Ring {
            replicas,
            hash,
            keys: Vec::new(),
            peers: FnvHashMap::default(),
        }
    }

    /// Places the given peers on the ring.
    ///
    /// For each peer we derive **replicas** virtual nodes by hashing the replica index
    /// concatenated with the peer identifier (this distinguishes virtual nodes which would
    /// otherwise all collide on the same position). Repeated calls are additive - the ring
    /// is re-sorted once per call, not once per peer.
    pub fn add<S: AsRef<str>>(&mut self, peers: &[S]) {
        for peer in peers {
            for replica in 0..self.replicas {
                let position = (self.hash)(format!("{}{}", replica, peer.as_ref()).as_bytes());
                self.keys.push(position);
                let _ = self.peers.insert(position, peer.as_ref().to_owned());
            }
        }

        self.keys.sort_unstable();
    }

    /// Returns the peer owning the given key or **None** on an empty ring.
    ///
    /// We binary search for the first virtual node at or after the key's hash and wrap around
    /// to the start of the (sorted) ring if the key hashes beyond the last virtual node.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let position = (self.hash)(key.as_bytes());
        let index = self.keys.partition_point(|&node| node < position) % self.keys.len();

        self.peers.get(&self.keys[index]).map(String::as_str)
    }

    /// Returns the number of virtual nodes currently placed on the ring.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Determines if no peer has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::Ring;
    use std::collections::HashSet;

    /// Parses the hashed string as number so that tests can lay out the ring by hand.
    ///
    /// A peer "6" with 3 replicas ends up as the virtual nodes 6, 16 and 26.
    fn stub_hash(data: &[u8]) -> u32 {
        std::str::from_utf8(data).unwrap().parse().unwrap()
    }

    #[test]
    fn keys_are_routed_to_the_expected_peers() {
        let mut ring = Ring::with_hash(3, stub_hash);
        ring.add(&["6", "4", "2"]);

        // The ring now consists of the virtual nodes 2, 4, 6, 12, 14, 16, 22, 24, 26...
        assert_eq!(ring.get("2").unwrap(), "2");
        assert_eq!(ring.get("11").unwrap(), "2");
        assert_eq!(ring.get("23").unwrap(), "4");

        // ...and a key hashing beyond the largest virtual node wraps around to the start.
        assert_eq!(ring.get("27").unwrap(), "2");
    }

    #[test]
    fn adding_peers_is_additive() {
        let mut ring = Ring::with_hash(3, stub_hash);
        ring.add(&["6", "4", "2"]);

        // 27 used to wrap around to peer "2" - with "8" on the ring (nodes 8, 18, 28) it now
        // lands on the new peer instead.
        ring.add(&["8"]);
        assert_eq!(ring.get("27").unwrap(), "8");
    }

    #[test]
    fn every_peer_receives_its_replica_count() {
        let peers = ["alpha", "beta", "gamma"];
        let mut ring = Ring::new(50);
        ring.add(&peers);

        assert_eq!(ring.len(), 3 * 50);

        // All virtual nodes map back to one of the registered peers...
        let known: HashSet<&str> = peers.iter().copied().collect();
        for key in 0..100 {
            assert_eq!(known.contains(ring.get(&format!("key-{}", key)).unwrap()), true);
        }
    }

    #[test]
    fn lookups_are_deterministic() {
        let mut ring = Ring::new(50);
        ring.add(&["http://10.0.0.1:2410", "http://10.0.0.2:2410", "http://10.0.0.3:2410"]);

        for key in 0..32 {
            let key = format!("key-{}", key);
            let owner = ring.get(&key).unwrap().to_owned();
            for _ in 0..8 {
                assert_eq!(ring.get(&key).unwrap(), owner);
            }
        }
    }

    #[test]
    fn an_empty_ring_owns_nothing() {
        let ring = Ring::new(50);
        assert_eq!(ring.is_empty(), true);
        assert_eq!(ring.get("anything"), None);
    }
}
