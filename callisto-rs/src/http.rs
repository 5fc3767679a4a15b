//! Provides the HTTP transport which connects the cache groups of a cluster.
//!
//! An [HttpPool](HttpPool) covers both directions of the peer protocol. As a server it exposes
//! every group of a [Registry](crate::group::Registry) under
//! `{base_path}{group}/{key}` and answers each request by running the ordinary
//! [Group::get](crate::group::Group::get) logic locally. As a client side it maintains one
//! [HttpClient](HttpClient) per known peer plus a [Ring](crate::ring::Ring) assigning each key
//! to its owning peer, which makes the pool a [PeerSelector](crate::peers::PeerSelector) ready
//! to be plugged into a group.
//!
//! Note that the pool never elects the local process itself: if the ring routes a key back to
//! the pool's own public URL, the key is simply served locally. This is what terminates the
//! delegation - the owning node answers from its own cache or loader instead of forwarding
//! the request another hop.
//!
//! # Examples
//!
//! ```no_run
//! # use callisto::group::{FnLoader, Registry};
//! # use callisto::http::HttpPool;
//! # use std::sync::Arc;
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(Registry::new());
//!     let scores = registry
//!         .create("scores", 64 * 1024 * 1024, Arc::new(FnLoader::new(
//!             |key: String| async move { Ok(key.into_bytes()) },
//!         )))
//!         .unwrap();
//!
//!     let pool = HttpPool::new("http://10.0.0.2:2410", registry);
//!     pool.set_peers(&["http://10.0.0.2:2410", "http://10.0.0.3:2410"]);
//!     scores.register_peers(pool.clone()).unwrap();
//!
//!     let shutdown = callisto::signals::install();
//!     pool.serve("0.0.0.0:2410", shutdown).await.unwrap();
//! }
//! ```
use crate::group::Registry;
use crate::peers::{PeerClient, PeerSelector};
use crate::ring::Ring;
use crate::wire::{FetchRequest, FetchResponse};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode, Uri};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Contains the path prefix under which the cache endpoint is mounted.
pub const DEFAULT_BASE_PATH: &str = "/_callisto/";

/// Determines how many virtual nodes are placed on the ring per peer.
const DEFAULT_REPLICAS: usize = 50;

/// Couples the ring with the per-peer clients.
///
/// Both are guarded by a single mutex so that a peer set update is atomic: a lookup either
/// sees the old ring with the old clients or the new ring with the new clients, never a mix.
struct Routing {
    ring: Ring,
    clients: HashMap<String, Arc<HttpClient>>,
}

/// Connects the local cache groups with their peers in the cluster.
///
/// See the module documentation for an overview. A pool is created once per process and shared
/// as **Arc** between the groups (as their peer selector) and the server task driving
/// [serve](HttpPool::serve).
pub struct HttpPool {
    public_url: String,
    base_path: String,
    registry: Arc<Registry>,
    routing: Mutex<Routing>,
}

impl HttpPool {
    /// Creates a pool for the process reachable under **public_url**, serving the given
    /// registry.
    ///
    /// The endpoint is mounted under [DEFAULT_BASE_PATH](DEFAULT_BASE_PATH).
    pub fn new(public_url: impl Into<String>, registry: Arc<Registry>) -> Arc<Self> {
        HttpPool::with_base_path(public_url, registry, DEFAULT_BASE_PATH)
    }

    /// Creates a pool using a custom path prefix.
    ///
    /// The prefix has to start and end with a slash and must be shared by all members of the
    /// cluster, as it is also baked into the URLs used to query peers.
    pub fn with_base_path(
        public_url: impl Into<String>,
        registry: Arc<Registry>,
        base_path: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(HttpPool {
            public_url: public_url.into(),
            base_path: base_path.into(),
            registry,
            routing: Mutex::new(Routing {
                ring: Ring::new(DEFAULT_REPLICAS),
                clients: HashMap::new(),
            }),
        })
    }

    /// Returns the URL under which this process expects to be reached by its peers.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Replaces the set of known peers.
    ///
    /// This rebuilds the ring from scratch and creates one client per peer - which is also
    /// the way to shrink the cluster, as the ring itself is add-only. The swap is atomic:
    /// lookups never observe a partially updated peer set.
    pub fn set_peers<S: AsRef<str>>(&self, peers: &[S]) {
        let mut ring = Ring::new(DEFAULT_REPLICAS);
        ring.add(peers);

        let mut clients = HashMap::with_capacity(peers.len());
        for peer in peers {
            let _ = clients.insert(
                peer.as_ref().to_owned(),
                Arc::new(HttpClient::new(format!(
                    "{}{}",
                    peer.as_ref(),
                    self.base_path
                ))),
            );
        }

        log::info!(
            "Updated the peer set: {} peers as {} virtual nodes.",
            clients.len(),
            ring.len()
        );

        *self.routing.lock().unwrap() = Routing { ring, clients };
    }

    /// Serves the cache endpoint on the given address until the shutdown flag flips.
    ///
    /// Each incoming request is handled in its own task. The server drains in-flight requests
    /// once a shutdown has been signalled (e.g. by [signals::install](crate::signals::install)).
    pub async fn serve(
        self: &Arc<Self>,
        address: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let address: SocketAddr = address
            .parse()
            .with_context(|| format!("Cannot parse '{}' into a server address.", address))?;

        let pool = self.clone();
        let service = make_service_fn(move |_connection| {
            let pool = pool.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| handle(pool.clone(), request)))
            }
        });

        let server = hyper::server::Server::try_bind(&address)
            .with_context(|| format!("Cannot open the cache endpoint on {}.", address))?
            .serve(service);
        log::info!("Opened cache endpoint on {}...", address);

        server
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .context("The cache endpoint terminated abnormally.")?;
        log::info!("Closed cache endpoint on {}.", address);

        Ok(())
    }
}

impl PeerSelector for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerClient>> {
        let routing = self.routing.lock().unwrap();
        match routing.ring.get(key) {
            Some(peer) if peer != self.public_url => {
                log::debug!("Delegating '{}' to its owning peer {}...", key, peer);
                routing
                    .clients
                    .get(peer)
                    .map(|client| -> Arc<dyn PeerClient> { client.clone() })
            }
            _ => None,
        }
    }
}

/// Answers a single request against the cache endpoint.
///
/// The path is expected to be `{base_path}{group}/{key}` with percent-encoded segments. A
/// request outside the base path or with a malformed remainder is refused without consulting
/// any cache.
async fn handle(
    pool: Arc<HttpPool>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = request.uri().path().to_owned();
    log::debug!("{} {}", request.method(), path);

    let rest = match path.strip_prefix(pool.base_path.as_str()) {
        Some(rest) => rest,
        None => {
            log::error!(
                "Received a request outside of the configured base path: {}",
                path
            );
            return Ok(status_response(StatusCode::NOT_FOUND, "not found"));
        }
    };

    // Exactly one split: the first segment names the group, the remainder is the key...
    let mut parts = rest.splitn(2, '/');
    let (group_name, key) = match (parts.next(), parts.next()) {
        (Some(group_name), Some(key)) => match (decode(group_name), decode(key)) {
            (Some(group_name), Some(key)) => (group_name, key),
            _ => return Ok(status_response(StatusCode::BAD_REQUEST, "bad request")),
        },
        _ => return Ok(status_response(StatusCode::BAD_REQUEST, "bad request")),
    };

    let group = match pool.registry.lookup(&group_name) {
        Some(group) => group,
        None => {
            return Ok(status_response(
                StatusCode::NOT_FOUND,
                format!("no such cache: {}", group_name),
            ));
        }
    };

    match group.get(&key).await {
        Ok(value) => {
            let mut response =
                Response::new(Body::from(FetchResponse::new(value.to_bytes()).encode()));
            let _ = response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );

            Ok(response)
        }
        Err(error) => Ok(status_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", error),
        )),
    }
}

/// Percent-decodes a path segment, treating invalid encodings as absent.
fn decode(segment: &str) -> Option<String> {
    urlencoding::decode(segment)
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Builds a plain text response with the given status.
fn status_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;

    response
}

/// Fetches cache values from one specific peer.
///
/// A client holds the full URL prefix of its peer's cache endpoint (base URL plus base path).
/// It is the production implementation of [PeerClient](crate::peers::PeerClient): group and
/// key are percent-encoded into the path, the response body is decoded as a
/// [FetchResponse](crate::wire::FetchResponse).
pub struct HttpClient {
    base_url: String,
    client: hyper::Client<HttpConnector>,
}

impl HttpClient {
    /// Creates a client fetching from the endpoint mounted at the given URL prefix.
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpClient {
            base_url: base_url.into(),
            client: hyper::Client::new(),
        }
    }
}

#[async_trait]
impl PeerClient for HttpClient {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(&request.group),
            urlencoding::encode(&request.key)
        );
        let url: Uri = url
            .parse()
            .with_context(|| format!("Cannot parse '{}' into a peer URL.", url))?;

        let response = self
            .client
            .get(url)
            .await
            .with_context(|| format!("Failed to query peer {}.", self.base_url))?;
        if response.status() != StatusCode::OK {
            return Err(anyhow!(
                "Peer {} answered with status {}.",
                self.base_url,
                response.status()
            ));
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .with_context(|| format!("Failed to read the answer of peer {}.", self.base_url))?;

        FetchResponse::decode(&body)
            .with_context(|| format!("Failed to decode the answer of peer {}.", self.base_url))
    }
}

#[cfg(test)]
mod tests {
    use crate::group::{FnLoader, Registry};
    use crate::http::{HttpClient, HttpPool};
    use crate::peers::{PeerClient, PeerSelector};
    use crate::spawn;
    use crate::testing::test_async;
    use crate::wire::{FetchRequest, FetchResponse};
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Waits until a server socket answers on the given address.
    async fn await_endpoint(address: &str) {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(address).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        panic!("The endpoint on {} did not come up in time.", address);
    }

    #[test]
    fn ensure_the_endpoint_serves_fetch_requests() {
        // We want exclusive access to the ports on which we fire up our test endpoints...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let registry = Arc::new(Registry::new());
            let _ = registry
                .create(
                    "groupA",
                    0,
                    Arc::new(FnLoader::new(|key: String| async move {
                        match key.as_str() {
                            "someKey" => Ok(b"value1".to_vec()),
                            "weird key/slash" => Ok(b"value2".to_vec()),
                            _ => Err(anyhow::anyhow!("There is no value for '{}'.", key)),
                        }
                    })),
                )
                .unwrap();

            let pool = HttpPool::new("http://127.0.0.1:1503", registry);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let serve_pool = pool.clone();
            spawn!(async move {
                serve_pool.serve("127.0.0.1:1503", shutdown_rx).await.unwrap();
            });
            await_endpoint("127.0.0.1:1503").await;

            let client = hyper::Client::new();

            // A proper request yields an encoded response...
            let response = client
                .get("http://127.0.0.1:1503/_callisto/groupA/someKey".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
                "application/octet-stream"
            );
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(FetchResponse::decode(&body).unwrap().value.as_ref(), b"value1");

            // The peer client escapes troublesome keys so that they survive the path scheme...
            let peer_client = HttpClient::new("http://127.0.0.1:1503/_callisto/");
            let response = peer_client
                .fetch(FetchRequest::new("groupA", "weird key/slash"))
                .await
                .unwrap();
            assert_eq!(response.value.as_ref(), b"value2");

            // A path which doesn't name a group AND a key is a bad request...
            let response = client
                .get("http://127.0.0.1:1503/_callisto/groupA".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            // An unknown group is reported as 404...
            let response = client
                .get("http://127.0.0.1:1503/_callisto/unknown/someKey".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            // ...just like a request outside of the configured base path...
            let response = client
                .get("http://127.0.0.1:1503/other/path".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            // ...whereas a failing loader yields a 500 carrying the error text.
            let response = client
                .get("http://127.0.0.1:1503/_callisto/groupA/otherKey".parse().unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

            let _ = shutdown_tx.send(true);
        });
    }

    #[test]
    fn ensure_cluster_delegation_works() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let loads_a = Arc::new(AtomicUsize::new(0));
            let loads_b = Arc::new(AtomicUsize::new(0));

            let counter = loads_a.clone();
            let registry_a = Arc::new(Registry::new());
            let group_a = registry_a
                .create(
                    "scores",
                    0,
                    Arc::new(FnLoader::new(move |key: String| {
                        let counter = counter.clone();
                        async move {
                            let _ = counter.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("a:{}", key).into_bytes())
                        }
                    })),
                )
                .unwrap();

            let counter = loads_b.clone();
            let registry_b = Arc::new(Registry::new());
            let group_b = registry_b
                .create(
                    "scores",
                    0,
                    Arc::new(FnLoader::new(move |key: String| {
                        let counter = counter.clone();
                        async move {
                            let _ = counter.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("b:{}", key).into_bytes())
                        }
                    })),
                )
                .unwrap();

            // Wire up a two node cluster on the ports 1504 and 1505...
            let peers = ["http://127.0.0.1:1504", "http://127.0.0.1:1505"];
            let pool_a = HttpPool::new(peers[0], registry_a.clone());
            let pool_b = HttpPool::new(peers[1], registry_b.clone());
            pool_a.set_peers(&peers);
            pool_b.set_peers(&peers);
            group_a.register_peers(pool_a.clone()).unwrap();
            group_b.register_peers(pool_b.clone()).unwrap();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let serve_pool = pool_a.clone();
            let serve_shutdown = shutdown_rx.clone();
            spawn!(async move {
                serve_pool.serve("127.0.0.1:1504", serve_shutdown).await.unwrap();
            });
            let serve_pool = pool_b.clone();
            spawn!(async move {
                serve_pool.serve("127.0.0.1:1505", shutdown_rx).await.unwrap();
            });
            await_endpoint("127.0.0.1:1504").await;
            await_endpoint("127.0.0.1:1505").await;

            // Both nodes share one ring, so we can simply ask node A's pool which keys it
            // would delegate and which it would serve itself...
            let mut remote_key = None;
            let mut local_key = None;
            for i in 0..256 {
                let key = format!("key-{}", i);
                if pool_a.pick_peer(&key).is_some() {
                    let _ = remote_key.get_or_insert(key);
                } else {
                    let _ = local_key.get_or_insert(key);
                }
                if remote_key.is_some() && local_key.is_some() {
                    break;
                }
            }
            let remote_key = remote_key.unwrap();
            let local_key = local_key.unwrap();

            // A key owned by node B is answered by B's loader...
            let value = group_a.get(&remote_key).await.unwrap();
            assert_eq!(value.as_slice(), format!("b:{}", remote_key).as_bytes());
            assert_eq!(loads_b.load(Ordering::SeqCst), 1);
            assert_eq!(loads_a.load(Ordering::SeqCst), 0);

            // ...and stays cached over there: a second request crosses the network again and
            // hits B's cache, leaving node A's cache empty...
            let value = group_a.get(&remote_key).await.unwrap();
            assert_eq!(value.as_slice(), format!("b:{}", remote_key).as_bytes());
            assert_eq!(loads_b.load(Ordering::SeqCst), 1);
            assert_eq!(group_a.is_empty(), true);

            // ...whereas a key owned by node A itself is loaded and cached locally.
            let value = group_a.get(&local_key).await.unwrap();
            assert_eq!(value.as_slice(), format!("a:{}", local_key).as_bytes());
            assert_eq!(loads_a.load(Ordering::SeqCst), 1);
            assert_eq!(group_a.len(), 1);

            let _ = shutdown_tx.send(true);
        });
    }

    #[test]
    fn ensure_fallback_when_the_owning_peer_is_down() {
        test_async(async {
            let loads = Arc::new(AtomicUsize::new(0));
            let counter = loads.clone();

            let registry = Arc::new(Registry::new());
            let group = registry
                .create(
                    "scores",
                    0,
                    Arc::new(FnLoader::new(move |key: String| {
                        let counter = counter.clone();
                        async move {
                            let _ = counter.fetch_add(1, Ordering::SeqCst);
                            Ok(format!("a:{}", key).into_bytes())
                        }
                    })),
                )
                .unwrap();

            // Nothing listens on port 9, so every delegation to this peer must fail...
            let pool = HttpPool::new("http://127.0.0.1:1506", registry.clone());
            pool.set_peers(&["http://127.0.0.1:1506", "http://127.0.0.1:9"]);
            group.register_peers(pool.clone()).unwrap();

            let mut delegated_key = None;
            for i in 0..256 {
                let key = format!("key-{}", i);
                if pool.pick_peer(&key).is_some() {
                    delegated_key = Some(key);
                    break;
                }
            }
            let delegated_key = delegated_key.unwrap();

            // The remote fetch fails, the local loader answers anyway...
            let value = group.get(&delegated_key).await.unwrap();
            assert_eq!(value.as_slice(), format!("a:{}", delegated_key).as_bytes());
            assert_eq!(loads.load(Ordering::SeqCst), 1);

            // ...and its value has been cached, so the broken peer is not asked again.
            let value = group.get(&delegated_key).await.unwrap();
            assert_eq!(value.as_slice(), format!("a:{}", delegated_key).as_bytes());
            assert_eq!(loads.load(Ordering::SeqCst), 1);
            assert_eq!(group.len(), 1);
        });
    }

    #[test]
    fn a_process_never_delegates_to_itself() {
        let registry = Arc::new(Registry::new());
        let pool = HttpPool::new("http://127.0.0.1:1507", registry);

        // An empty ring selects nobody...
        assert_eq!(pool.pick_peer("anything").is_none(), true);

        // ...and neither does a ring which only contains this very process.
        pool.set_peers(&["http://127.0.0.1:1507"]);
        for i in 0..32 {
            assert_eq!(pool.pick_peer(&format!("key-{}", i)).is_none(), true);
        }
    }
}
