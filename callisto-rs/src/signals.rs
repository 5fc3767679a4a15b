//! Installs a signal handler which requests a shutdown on CTRL+C or SIGHUP.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGHUP** and then flips the
//! returned [watch](tokio::sync::watch) channel to **true**. Anything interested in a graceful
//! shutdown (most notably [HttpPool::serve](crate::http::HttpPool::serve)) simply keeps a clone
//! of the receiver around and reacts once its value changes.
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

/// Installs a signal handler and returns the shutdown flag being flipped by it.
///
/// The returned receiver starts out as **false** and becomes **true** once either **CTRL+C**
/// or **SIGHUP** has been received. Receivers can be cloned freely, therefore a single call at
/// startup is enough to supply every component of the process.
pub fn install() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    let _ = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup()).unwrap();

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down...");
            }
        }

        let _ = tx.send(true);
    });

    rx
}
