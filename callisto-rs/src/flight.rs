//! Collapses concurrent computations for the same key into a single execution.
//!
//! Whenever a cache misses, the missing value has to be produced - either by asking the owning
//! peer or by running the local loader. Both can be expensive, and under load many callers tend
//! to miss on the very same key at the very same time. A [Flight](Flight) guarantees that for
//! any key at most one producer runs at a time: the first caller becomes the producer while all
//! concurrent callers for the same key simply await its outcome and receive the identical result
//! (or the identical error).
//!
//! The registry only tracks computations which are actually in flight. Once the producer has
//! completed and its outcome has been published, the key is deregistered again, so a later call
//! for the same key starts a fresh computation. Unrelated keys never wait on each other as the
//! registry lock is only held while touching the map, never while a producer runs.
//!
//! # Examples
//!
//! ```
//! # use callisto::flight::Flight;
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let flight: Flight<String> = Flight::new();
//!
//! let value = flight
//!     .execute("answer", || async { Ok("42".to_owned()) })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(value, "42");
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Represents the shared result of a single producer run.
///
/// Errors are wrapped in an **Arc** so that every waiting caller observes the very same error
/// instance without requiring the error type to be cloneable.
pub type Outcome<T> = Result<T, Arc<anyhow::Error>>;

/// The completion signal of an in-flight computation.
///
/// Starts out as **None** and is flipped to the outcome exactly once.
type Signal<T> = watch::Receiver<Option<Outcome<T>>>;

/// Deduplicates concurrent computations keyed by a string.
///
/// See the module documentation for the guarantees provided.
pub struct Flight<T> {
    calls: Mutex<HashMap<String, Signal<T>>>,
}

impl<T> Default for Flight<T> {
    fn default() -> Self {
        Flight {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the given key from the registry once the producing call completes.
///
/// Being a drop guard, this also covers the case where the producing future is dropped before
/// running to completion - the key must not remain registered with a signal that will never
/// fire, as this would stall every future caller for that key.
struct Deregister<'a, T> {
    calls: &'a Mutex<HashMap<String, Signal<T>>>,
    key: &'a str,
}

impl<T> Drop for Deregister<'_, T> {
    fn drop(&mut self) {
        let _ = self.calls.lock().unwrap().remove(self.key);
    }
}

impl<T: Clone> Flight<T> {
    /// Creates a new flight with an empty registry.
    pub fn new() -> Self {
        Flight::default()
    }

    /// Executes the given producer unless a computation for the same key is already in flight.
    ///
    /// If this caller is the first one for the given key, the producer is invoked and its
    /// outcome is published to every caller which piled up in the meantime. Otherwise the
    /// producer is dropped unused and the caller awaits the outcome of the in-flight
    /// computation.
    ///
    /// # Examples
    ///
    /// Concurrent callers share a single execution:
    /// ```
    /// # use callisto::flight::Flight;
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use std::sync::Arc;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let flight: Arc<Flight<i32>> = Arc::new(Flight::new());
    /// let runs = Arc::new(AtomicUsize::new(0));
    ///
    /// let mut tasks = Vec::new();
    /// for _ in 0..8 {
    ///     let flight = flight.clone();
    ///     let runs = runs.clone();
    ///     tasks.push(tokio::spawn(async move {
    ///         flight
    ///             .execute("key", || async move {
    ///                 let _ = runs.fetch_add(1, Ordering::SeqCst);
    ///                 tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    ///                 Ok(42)
    ///             })
    ///             .await
    ///     }));
    /// }
    ///
    /// for task in tasks {
    ///     assert_eq!(task.await.unwrap().unwrap(), 42);
    /// }
    /// assert_eq!(runs.load(Ordering::SeqCst), 1);
    /// # }
    /// ```
    pub async fn execute<F, Fut>(&self, key: &str, producer: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Either join an in-flight computation or register ourselves as its producer. The
        // registry lock is released before anything is awaited.
        let role = {
            let mut calls = self.calls.lock().unwrap();
            if let Some(signal) = calls.get(key) {
                Err(signal.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                let _ = calls.insert(key.to_owned(), rx);
                Ok(tx)
            }
        };

        match role {
            Ok(tx) => {
                let deregister = Deregister {
                    calls: &self.calls,
                    key,
                };

                let outcome = producer().await.map_err(Arc::new);

                // Publish the outcome before deregistering the key, so that a caller which
                // joined while the producer ran finds the signal fired.
                let _ = tx.send(Some(outcome.clone()));
                drop(deregister);

                outcome
            }
            Err(mut signal) => {
                loop {
                    if let Some(outcome) = signal.borrow().as_ref() {
                        return outcome.clone();
                    }
                    if signal.changed().await.is_err() {
                        // The producing call was dropped before publishing an outcome...
                        return Err(Arc::new(anyhow::anyhow!(
                            "The computation for this key was abandoned before producing a result."
                        )));
                    }
                }
            }
        }
    }
}
