//! Defines the seams through which a cache group reaches the rest of the cluster.
//!
//! A cache group itself is completely unaware of networking. All it knows is that there might
//! be a [PeerSelector](PeerSelector) which, given a key, elects another cluster member as the
//! owner of that key, and that such an owner can be asked for a value through the
//! [PeerClient](PeerClient) it hands out. The HTTP transport in [http](crate::http) provides
//! the production implementation of both; tests are free to plug in stubs.
use crate::wire::{FetchRequest, FetchResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Fetches values from one specific cluster member.
///
/// Implementations hold everything needed to address their peer (e.g. its base URL) so that
/// a fetch only has to name the cache group and the key being requested.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Requests the value for the group and key named in the given request from this peer.
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse>;
}

/// Elects the cluster member which owns a given key.
pub trait PeerSelector: Send + Sync {
    /// Returns a client for the peer owning the given key.
    ///
    /// Returning **None** signals that the key should be served locally - either because no
    /// peers are known at all or because this very process is the owner.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>>;
}
