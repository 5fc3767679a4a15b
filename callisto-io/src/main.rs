use anyhow::Context;
use async_trait::async_trait;
use callisto::config::Config;
use callisto::group::{Loader, Registry};
use callisto::http::HttpPool;
use callisto::spawn;
use std::path::PathBuf;
use std::sync::Arc;

/// Serves cache misses from files below the data directory.
///
/// Each cache group reads from its own sub directory, the key is the file name. This stands in
/// for whatever expensive backend a real deployment would wrap - the point of the exercise is
/// that each file is read once per cluster and then served from memory.
struct FileLoader {
    directory: PathBuf,
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        if key.split('/').any(|segment| segment == "..") {
            return Err(anyhow::anyhow!(
                "The key '{}' tries to escape the data directory.",
                key
            ));
        }

        let path = self.directory.join(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Cannot read {}.", path.display()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    callisto::init_logging();
    log::info!(
        "||. CALLISTO (v {} - rev {}) running on {} core(s) in {} CPU(s)",
        callisto::CALLISTO_VERSION,
        callisto::CALLISTO_REVISION,
        num_cpus::get(),
        num_cpus::get_physical()
    );

    let shutdown = callisto::signals::install();

    // Load the config and keep watching it for changes...
    let config = Arc::new(Config::new("config/settings.yml"));
    if let Err(error) = config.load().await {
        log::error!("{}", error);
    }
    callisto::config::run_change_monitor(config.clone(), shutdown.clone());

    // Create the configured cache groups, all sharing this node's pool as their selector.
    // Any wiring error (duplicate cache name, malformed budget) aborts the startup - we never
    // serve with a config we only partially understood...
    let handle = config.current();
    let registry = Arc::new(Registry::new());
    let pool = HttpPool::new(handle.public_url(), registry.clone());

    let data_directory = PathBuf::from(handle.data_directory());
    for cache in handle.caches()? {
        let loader = Arc::new(FileLoader {
            directory: data_directory.join(&cache.name),
        });
        let group = registry.create(&cache.name, cache.max_memory, loader)?;
        group.register_peers(pool.clone())?;
    }

    pool.set_peers(&handle.peers());

    // Re-apply the peer set whenever the config file changes...
    let mut notifier = config.notifier();
    let monitored_config = config.clone();
    let monitored_pool = pool.clone();
    spawn!(async move {
        while notifier.recv().await.is_ok() {
            monitored_pool.set_peers(&monitored_config.current().peers());
        }
    });

    pool.serve(&handle.server_addr(), shutdown).await
}
