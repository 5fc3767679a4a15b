//! Callisto is a library for building cooperative in-memory caches which spread their contents
//! across a cluster of peer processes.
//!
//! # Introduction
//! **Callisto** keeps a bounded cache of expensive-to-produce values in the memory of each
//! process and connects those processes over HTTP so that every key is computed or fetched
//! **at most once across the whole cluster**. A consistent hash ring assigns each key to an
//! owning node; every other node delegates requests for that key to the owner instead of
//! producing the value itself. Within a process, concurrent requests for the same key collapse
//! into a single load.
//!
//! This addresses the classic thundering herd problem of cache farms: when a popular value
//! expires or a node restarts, only one loader runs in the whole cluster instead of one per
//! process - which is what keeps databases and upstream services alive on busy days.
//!
//! # Features
//! * **Size constrained LRU caches** - each cache group tracks the bytes allocated by its keys
//!   and values and evicts the least recently used entries once its budget is exceeded. See
//!   [lru](lru).
//! * **Consistent hashing with virtual nodes** - keys are spread evenly across the cluster and
//!   a changed peer set only relocates a small share of them. See [ring](ring).
//! * **Request deduplication** - for any key, at most one producer runs per process at a time,
//!   no matter how many callers pile up. See [flight](flight).
//! * **Graceful degradation** - a node which cannot reach the owner of a key falls back to its
//!   local loader. A remote failure costs latency, never correctness. See [group](group).
//! * **100% Async/Await** - the whole library builds upon [tokio](https://tokio.rs/) and the
//!   async/await primitives as provided by Rust.
//! * **Reload-aware config facility** which permits to update the configuration during
//!   operation. Therefore, no restart is ever required. This is kind of important for an
//!   in-memory application which might have an expensive startup time. See [config](config).
//!
//! # Modules
//! * **view**: Immutable views on cached values. See [view](view).
//! * **lru**: The size constrained LRU cache backing each group. See [lru](lru).
//! * **ring**: The consistent hash ring assigning keys to peers. See [ring](ring).
//! * **flight**: Collapses concurrent loads of the same key. See [flight](flight).
//! * **group**: Cache groups and the registry to look them up by name. See [group](group).
//! * **http**: The HTTP transport connecting the cluster. See [http](http).
//!
//! # Examples
//! A complete example of using Callisto can be found in the runnable instance **callisto-io**
//! which ships next to this library: it wires a config file, a file backed loader and the HTTP
//! endpoint into a full cache node.
//!
//! Creating and using a cache group locally:
//! ```
//! # use callisto::group::{FnLoader, Registry};
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Registry::new();
//! let scores = registry
//!     .create("scores", 64 * 1024, Arc::new(FnLoader::new(|key: String| async move {
//!         // An expensive computation or database query would live here...
//!         Ok(format!("score for {}", key).into_bytes())
//!     })))
//!     .unwrap();
//!
//! assert_eq!(scores.get("tom").await.unwrap().as_slice(), b"score for tom");
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod config;
pub mod flight;
pub mod fmt;
pub mod group;
pub mod http;
pub mod lru;
pub mod peers;
pub mod ring;
pub mod signals;
pub mod view;
pub mod wire;

/// Contains the version of the Callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Callisto build being used.
pub const CALLISTO_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// This properly initializes **simplelog** to log to stdout. As we intend Callisto nodes to be
/// run in docker containers, this is all that is needed for proper logging. The date format
/// being used is digestible by established tools like **greylog**.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. These are the ports (1503..) on which we start local endpoints for
        /// integration tests. Using this lock, we can still execute all other tests in
        /// parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
