//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. Note that we observe this file for changes and reload it once a change is detected.
//! Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received.
//!
//! Being an in-memory cache we want to prevent restarts / downtimes as much as possible - a
//! restarted node comes back empty and has to re-earn its whole working set.
//!
//! Note that the **Config** struct is kind of constant and can be kept around once created.
//! However, a [Handle](Handle) obtained via **Config::current()** should not be stored, as it
//! will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! ```
//! # use callisto::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! server:
//!     port: 2410
//! peers:
//!     - 'http://10.0.0.2:2410'
//!     - 'http://10.0.0.3:2410'
//! ", None).unwrap();
//!
//! assert_eq!(config.current().server_addr(), "0.0.0.0:2410");
//! assert_eq!(config.current().peers().len(), 2);
//! # }
//! ```
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::parse_size;
use anyhow::Context;
use tokio::sync::watch;

/// Provides access to the system configuration.
///
/// Note that it is highly recommended to register a change listener by calling
/// [Config::notifier](Config::notifier) as we expect all components to pick up config changes
/// without restarting the application.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

/// Describes one cache group to be created at startup.
///
/// Obtained via [Handle::caches](Handle::caches) which reads the **caches** section of the
/// config file.
pub struct CacheSettings {
    /// Contains the name of the cache group.
    pub name: String,

    /// Contains the memory budget of the group in bytes (0 = unbounded).
    pub max_memory: usize,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will neither read the file nor install a change monitor - this is left
    /// to [load](Config::load) and [run_change_monitor](run_change_monitor) so that tests can
    /// operate on in-memory data only.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    ///
    /// Note that this is a fairly efficient operation but still provides some overhead.
    /// Therefore this shouldn't be placed in an inner loop.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!("Config file doesn't exist or is an unmounted docker volume - skipping config load.");
                return Ok(());
            }
        }

        let config_data = match tokio::fs::read_to_string(&self.filename).await {
            Ok(data) => data,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot load config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Validates and writes the given config contents to the underlying file.
    ///
    /// The change monitor will pick the new contents up just like any external edit, therefore
    /// there is no need to trigger a reload manually.
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        if let Err(error) = YamlLoader::load_from_str(config) {
            Err(anyhow::anyhow!("Cannot parse config data: {}", error))
        } else {
            tokio::fs::write(&self.filename, config)
                .await
                .context("Failed to write to config file!")?;
            log::info!("Config has been updated successfully!");

            Ok(())
        }
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use callisto::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// server:
    ///     port: 12345
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().server_addr(), "0.0.0.0:12345");
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = match YamlLoader::load_from_str(data) {
            Ok(docs) => docs,
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Cannot parse config file {}: {}",
                    &self.filename,
                    error
                ));
            }
        };

        let doc = match docs.into_iter().next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Null,
        };

        // Store the updated config...
        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.clone().send(());

        Ok(())
    }
}

impl Handle {
    /// Provides raw access to the currently loaded configuration document.
    pub fn yaml(&self) -> &Yaml {
        &self.config.0
    }

    /// Determines the address to which the cache endpoint is bound.
    ///
    /// This reads **server.host** and **server.port**. If no, an invalid or a partial config
    /// is present, fallback values are used: by default we use port 2410 and bind to "0.0.0.0".
    pub fn server_addr(&self) -> String {
        format!(
            "{}:{}",
            self.yaml()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
            self.port()
        )
    }

    /// Determines the URL under which this process is reachable for its peers.
    ///
    /// This reads **server.public_url** and is also the identifier under which the process
    /// expects itself in the **peers** list. If absent, a loopback URL derived from the
    /// server port is used, which is good enough for single node and test setups.
    pub fn public_url(&self) -> String {
        match self.yaml()["server"]["public_url"].as_str() {
            Some(url) => url.to_owned(),
            None => format!("http://127.0.0.1:{}", self.port()),
        }
    }

    /// Lists the base URLs of all cluster members as configured in **peers**.
    ///
    /// Note that this list is expected to contain the [public_url](Handle::public_url) of this
    /// very process - a process never delegates to itself, therefore listing every member on
    /// every node keeps the config uniform across the cluster.
    pub fn peers(&self) -> Vec<String> {
        self.yaml()["peers"]
            .as_vec()
            .map(|peers| {
                peers
                    .iter()
                    .filter_map(|peer| peer.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Determines the directory from which the file backed loader serves cache misses.
    ///
    /// This reads **data.directory** and defaults to "data".
    pub fn data_directory(&self) -> String {
        self.yaml()["data"]["directory"]
            .as_str()
            .unwrap_or("data")
            .to_owned()
    }

    /// Lists the cache groups to create, as configured in the **caches** section.
    ///
    /// Each entry maps a cache name to its memory budget, either as a plain number of bytes
    /// or using the suffix notation of [parse_size](crate::fmt::parse_size) ("64m", "1g").
    /// A malformed budget is reported as an error, as serving with an unintended cache size
    /// is worse than refusing to start.
    pub fn caches(&self) -> anyhow::Result<Vec<CacheSettings>> {
        let mut result = Vec::new();

        if let Some(caches) = self.yaml()["caches"].as_hash() {
            for (name, budget) in caches {
                let name = name
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("Encountered a non-string cache name."))?;
                let max_memory = match budget {
                    Yaml::Integer(bytes) if *bytes >= 0 => *bytes as usize,
                    Yaml::String(size) => parse_size(size)
                        .with_context(|| format!("Invalid memory budget for cache '{}'.", name))?,
                    _ => {
                        return Err(anyhow::anyhow!(
                            "Invalid memory budget for cache '{}'.",
                            name
                        ))
                    }
                };

                result.push(CacheSettings {
                    name: name.to_owned(),
                    max_memory,
                });
            }
        }

        Ok(result)
    }

    fn port(&self) -> i64 {
        self.yaml()["server"]["port"]
            .as_i64()
            .filter(|port| port > &0 && port <= &(u16::MAX as i64))
            .unwrap_or(2410)
    }
}

/// Installs a change monitor which re-loads the config file once it is modified on disk.
///
/// The monitor compares the "last modified" date of the file every 2s and will not perform a
/// structural comparison. Therefore it is the duty of each config user to gracefully handle
/// partial config changes. The monitor ends once the given shutdown flag flips to **true**.
pub fn run_change_monitor(config: Arc<Config>, shutdown: watch::Receiver<bool>) {
    let _ = tokio::spawn(async move {
        while !*shutdown.borrow() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            // This will contain the last modified date of the file on disk or be None if the
            // file is absent...
            let last_modified = config.last_modified().await;

            // Contains the timestamp when the file was loaded the last time or be None if no
            // data has been loaded yet...
            let last_loaded = config.config.load().1;

            // If a file is present and newer than the one previously loaded (or if none has
            // been loaded so far) -> perform a reload and broadcast an update if the file has
            // been successfully loaded...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => {
                        log::info!("System configuration was re-loaded.");
                    }
                    Err(error) => log::error!("Failed to re-load system config: {}", error),
                }
            }
        }
    });
}
