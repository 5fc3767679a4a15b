//! Provides the cache groups which coordinate local lookups, loading and peer delegation.
//!
//! A [Group](Group) is a named cache namespace. Reading a key via [Group::get](Group::get)
//! first consults the local [LRU cache](crate::lru::LRUCache). On a miss, the group enters its
//! load path, which is deduplicated per key by a [Flight](crate::flight::Flight) - no matter
//! how many callers miss on the same key at the same time, the value is produced exactly once.
//!
//! Producing a value first asks the [PeerSelector](crate::peers::PeerSelector) (if one has been
//! registered) whether another cluster member owns the key. If so, that peer is queried over
//! the network and its answer is passed through without populating the local cache - the owning
//! peer remains the cache of record, keeping each value resident on exactly one node. If no
//! peer is responsible, or if the remote fetch failed for whatever reason, the user supplied
//! [Loader](Loader) produces the value locally and the result is placed in the local cache.
//! A remote failure therefore costs latency but never fails a request.
//!
//! Groups are created through a [Registry](Registry) which enforces unique names and permits
//! looking a group up by name, which is what the HTTP endpoint does for incoming requests.
//!
//! # Examples
//!
//! ```
//! # use callisto::group::{FnLoader, Registry};
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Registry::new();
//! let scores = registry
//!     .create(
//!         "scores",
//!         1024 * 1024,
//!         Arc::new(FnLoader::new(|key: String| async move {
//!             // An expensive computation or database query would live here...
//!             Ok(format!("score for {}", key).into_bytes())
//!         })),
//!     )
//!     .unwrap();
//!
//! let value = scores.get("tom").await.unwrap();
//! assert_eq!(value.as_slice(), b"score for tom");
//! # }
//! ```
use crate::flight::Flight;
use crate::fmt::{format_short_duration, format_size};
use crate::lru::LRUCache;
use crate::peers::{PeerClient, PeerSelector};
use crate::view::ByteView;
use crate::wire::FetchRequest;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Produces the value for a key which is not present in any cache of the cluster.
///
/// This is the callback through which the surrounding application plugs its actual source of
/// data (a database, a file system, an expensive computation) into a cache group. A loader is
/// only ever invoked once per key and concurrent wave of requests - collapsing the load is the
/// whole point of the machinery around it.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Produces the raw value bytes for the given key.
    ///
    /// An **Err** is propagated verbatim to the callers of [Group::get](Group::get) and
    /// nothing is cached, so a failed key will be attempted again on its next request.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a plain async function into a [Loader](Loader).
///
/// # Examples
///
/// ```
/// # use callisto::group::{FnLoader, Loader};
/// # #[tokio::main]
/// # async fn main() {
/// let loader = FnLoader::new(|key: String| async move { Ok(key.into_bytes()) });
/// assert_eq!(loader.load("42").await.unwrap(), b"42".to_vec());
/// # }
/// ```
pub struct FnLoader<F> {
    function: F,
}

impl<F, Fut> FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send,
{
    /// Wraps the given function into a loader.
    pub fn new(function: F) -> Self {
        FnLoader { function }
    }
}

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.function)(key.to_owned()).await
    }
}

/// Represents a named cache namespace within the cluster.
///
/// See the module documentation for the exact read path. Groups are always created via
/// [Registry::create](Registry::create) and handed around as **Arc** - all methods take
/// **&self** and the group internally guards its mutable state, so a group can be shared
/// freely between any number of concurrent callers.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    cache: Mutex<LRUCache<ByteView>>,
    peers: Mutex<Option<Arc<dyn PeerSelector>>>,
    flight: Flight<ByteView>,
}

impl Group {
    fn new(name: &str, max_memory: usize, loader: Arc<dyn Loader>) -> Self {
        let mut cache = LRUCache::new(max_memory);

        let cache_name = name.to_owned();
        cache.set_eviction_listener(move |key, value: &ByteView| {
            log::debug!(
                "Cache {}: evicted '{}' ({}) to honor the memory budget...",
                cache_name,
                key,
                format_size(key.len() + value.len())
            );
        });

        Group {
            name: name.to_owned(),
            loader,
            cache: Mutex::new(cache),
            peers: Mutex::new(None),
            flight: Flight::new(),
        }
    }

    /// Returns the name of this cache group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the selector which elects the owning peer for each key.
    ///
    /// This may be called at most once per group. A second attempt indicates that the hosting
    /// application is wired up incorrectly, therefore an **Err** is returned which should
    /// abort the startup.
    pub fn register_peers(&self, selector: Arc<dyn PeerSelector>) -> anyhow::Result<()> {
        let mut peers = self.peers.lock().unwrap();
        if peers.is_some() {
            return Err(anyhow!(
                "A peer selector has already been registered for cache '{}'.",
                self.name
            ));
        }

        *peers = Some(selector);
        Ok(())
    }

    /// Retrieves the value for the given key.
    ///
    /// An empty key is refused immediately. Otherwise the local cache is consulted first and
    /// only a miss enters the (deduplicated) load path described in the module documentation.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callisto::group::{FnLoader, Registry};
    /// # use std::sync::Arc;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let registry = Registry::new();
    /// # let group = registry.create("demo", 0, Arc::new(FnLoader::new(
    /// #     |key: String| async move { Ok(key.into_bytes()) }
    /// # ))).unwrap();
    /// assert_eq!(group.get("tom").await.unwrap().as_slice(), b"tom");
    /// assert_eq!(group.get("").await.is_err(), true);
    /// # }
    /// ```
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if key.is_empty() {
            return Err(anyhow!("An empty key was requested from cache '{}'.", self.name));
        }

        if let Some(value) = self.cache.lock().unwrap().get(key) {
            log::debug!("Cache {}: '{}' was served from local memory...", self.name, key);
            return Ok(value.clone());
        }

        self.load(key).await
    }

    /// Produces the value for a key which missed the local cache.
    ///
    /// The flight guarantees at most one producer per key. Note that every waiter receives a
    /// clone of the same outcome - the shared error is re-wrapped here so that callers see an
    /// ordinary **anyhow::Error**.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        self.flight
            .execute(key, || async {
                let selector = self.peers.lock().unwrap().clone();
                if let Some(selector) = selector {
                    if let Some(peer) = selector.pick_peer(key) {
                        match self.fetch_from_peer(peer.as_ref(), key).await {
                            Ok(value) => return Ok(value),
                            Err(error) => log::warn!(
                                "Cache {}: fetching '{}' from the owning peer failed ({:#}). \
                                 Falling back to the local loader...",
                                self.name,
                                key,
                                error
                            ),
                        }
                    }
                }

                self.load_locally(key).await
            })
            .await
            .map_err(|error| anyhow!("{:#}", error))
    }

    /// Fetches the value from the peer owning the key.
    ///
    /// The answer is passed through to the caller without populating the local cache: the
    /// owning peer keeps the authoritative copy and subsequent requests are routed to it
    /// again.
    async fn fetch_from_peer(&self, peer: &dyn PeerClient, key: &str) -> anyhow::Result<ByteView> {
        let response = peer.fetch(FetchRequest::new(&self.name, key)).await?;
        log::debug!(
            "Cache {}: '{}' was fetched from the owning peer...",
            self.name,
            key
        );

        Ok(ByteView::from(response.value))
    }

    /// Invokes the loader and places its result in the local cache.
    async fn load_locally(&self, key: &str) -> anyhow::Result<ByteView> {
        let watch = Instant::now();
        let bytes = self.loader.load(key).await?;
        let value = ByteView::from(bytes);

        log::debug!(
            "Cache {}: loaded '{}' ({}) locally in {}...",
            self.name,
            key,
            format_size(value.len()),
            format_short_duration(watch.elapsed().as_micros() as i32)
        );

        self.cache
            .lock()
            .unwrap()
            .put(key.to_owned(), value.clone());

        Ok(value)
    }

    /// Returns the number of entries currently kept in the local cache.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Determines if the local cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    /// Returns the bytes currently allocated by the local cache.
    pub fn allocated_memory(&self) -> usize {
        self.cache.lock().unwrap().allocated_memory()
    }
}

/// Keeps track of all cache groups of the process.
///
/// The registry is created by the hosting application and passed by reference to anything
/// which needs to look a group up by name - most notably the HTTP endpoint which resolves the
/// group named in each incoming request. Groups are never removed once created.
#[derive(Default)]
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    /// Creates a cache group and publishes it under the given name.
    ///
    /// **max_memory** bounds the bytes allocated by the local cache of the group
    /// (0 = unbounded). Attempting to re-use a name is a wiring error and therefore reported
    /// as **Err** - the hosting application should abort its startup in this case rather than
    /// serve with an ambiguous namespace.
    pub fn create(
        &self,
        name: &str,
        max_memory: usize,
        loader: Arc<dyn Loader>,
    ) -> anyhow::Result<Arc<Group>> {
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(name) {
            return Err(anyhow!("A cache named '{}' has already been created.", name));
        }

        log::info!(
            "Creating cache {} with a memory budget of {}...",
            name,
            format_size(max_memory)
        );

        let group = Arc::new(Group::new(name, max_memory, loader));
        let _ = groups.insert(name.to_owned(), group.clone());

        Ok(group)
    }

    /// Looks up the group registered under the given name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use crate::group::{FnLoader, Loader, Registry};
    use crate::peers::{PeerClient, PeerSelector};
    use crate::wire::{FetchRequest, FetchResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A loader which counts its invocations and fails for keys starting with "missing".
    struct CountingLoader {
        runs: AtomicUsize,
    }

    impl CountingLoader {
        fn new() -> Arc<Self> {
            Arc::new(CountingLoader {
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.runs.fetch_add(1, Ordering::SeqCst);
            if key.starts_with("missing") {
                Err(anyhow::anyhow!("There is no value for '{}'.", key))
            } else {
                Ok(format!("local:{}", key).into_bytes())
            }
        }
    }

    /// A peer which counts its invocations and either answers or always fails.
    struct StubPeer {
        healthy: bool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PeerClient for StubPeer {
        async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(FetchResponse::new(
                    format!("remote:{}", request.key).into_bytes(),
                ))
            } else {
                Err(anyhow::anyhow!("The peer is unreachable."))
            }
        }
    }

    /// Routes every key to the wrapped peer.
    struct StubSelector {
        peer: Arc<StubPeer>,
    }

    impl StubSelector {
        fn new(healthy: bool) -> (Arc<Self>, Arc<StubPeer>) {
            let peer = Arc::new(StubPeer {
                healthy,
                fetches: AtomicUsize::new(0),
            });
            (Arc::new(StubSelector { peer: peer.clone() }), peer)
        }
    }

    impl PeerSelector for StubSelector {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerClient>> {
            Some(self.peer.clone())
        }
    }

    #[tokio::test]
    async fn values_are_loaded_once_and_then_served_from_memory() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"local:tom");
        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"local:tom");

        // The second request was a cache hit...
        assert_eq!(loader.runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn empty_keys_are_refused_without_touching_the_loader() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        assert_eq!(group.get("").await.is_err(), true);
        assert_eq!(loader.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loader_failures_are_propagated_and_not_cached() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        assert_eq!(group.get("missing-value").await.is_err(), true);
        assert_eq!(group.get("missing-value").await.is_err(), true);

        // A failed key remains absent and is attempted again on each request...
        assert_eq!(loader.runs.load(Ordering::SeqCst), 2);
        assert_eq!(group.is_empty(), true);
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_load() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let group = group.clone();
            tasks.push(tokio::spawn(async move { group.get("tom").await }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().as_slice(), b"local:tom");
        }

        assert_eq!(loader.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_answers_bypass_the_loader_and_stay_remote() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        let (selector, peer) = StubSelector::new(true);
        group.register_peers(selector).unwrap();

        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"remote:tom");
        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"remote:tom");

        // The owning peer remains the cache of record: the value is not kept locally and
        // every request crosses the network again...
        assert_eq!(loader.runs.load(Ordering::SeqCst), 0);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(group.is_empty(), true);
    }

    #[tokio::test]
    async fn remote_failures_fall_back_to_the_local_loader() {
        let loader = CountingLoader::new();
        let registry = Registry::new();
        let group = registry.create("scores", 0, loader.clone()).unwrap();

        let (selector, peer) = StubSelector::new(false);
        group.register_peers(selector).unwrap();

        // The peer fails, but the request is still answered - from the local loader...
        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"local:tom");
        assert_eq!(loader.runs.load(Ordering::SeqCst), 1);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);

        // ...and the locally loaded value has been cached, so the broken peer is not even
        // asked again.
        assert_eq!(group.get("tom").await.unwrap().as_slice(), b"local:tom");
        assert_eq!(loader.runs.load(Ordering::SeqCst), 1);
        assert_eq!(peer.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peers_can_only_be_registered_once() {
        let registry = Registry::new();
        let group = registry
            .create("scores", 0, CountingLoader::new())
            .unwrap();

        let (selector, _) = StubSelector::new(true);
        assert_eq!(group.register_peers(selector).is_ok(), true);

        let (selector, _) = StubSelector::new(true);
        assert_eq!(group.register_peers(selector).is_err(), true);
    }

    #[tokio::test]
    async fn group_names_are_unique_per_registry() {
        let registry = Registry::new();
        assert_eq!(
            registry.create("scores", 0, CountingLoader::new()).is_ok(),
            true
        );
        assert_eq!(
            registry.create("scores", 0, CountingLoader::new()).is_err(),
            true
        );

        assert_eq!(registry.lookup("scores").is_some(), true);
        assert_eq!(registry.lookup("unknown").is_none(), true);
    }

    #[tokio::test]
    async fn small_caches_evict_in_lru_order() {
        let registry = Registry::new();
        let group = registry
            .create(
                "tiny",
                10,
                Arc::new(FnLoader::new(|key: String| async move {
                    Ok(key.trim_start_matches('k').repeat(key.len() - 1).into_bytes())
                })),
            )
            .unwrap();

        // Sizes 3 + 3 + 4 fill the budget of 10 exactly, no eviction yet ("k1" -> "1",
        // "k2" -> "2", "k3" -> "33")...
        assert_eq!(group.get("k1").await.unwrap().as_slice(), b"1");
        assert_eq!(group.get("k2").await.unwrap().as_slice(), b"2");
        assert_eq!(group.get("k3").await.unwrap().as_slice(), b"33");
        assert_eq!(group.len(), 3);
        assert_eq!(group.allocated_memory(), 10);

        // A fourth entry of size 3 pushes the total to 13 and evicts "k1" (the least
        // recently used entry), which brings the total back to 10...
        assert_eq!(group.get("k4").await.unwrap().as_slice(), b"4");
        assert_eq!(group.len(), 3);
        assert_eq!(group.allocated_memory(), 10);

        // ...so asking for "k1" again runs the loader once more.
        assert_eq!(group.get("k1").await.unwrap().as_slice(), b"1");
    }
}
