//! Graceful shutdown.
//!
//! The server loop stops accepting connections once a [`ShutdownSignal`] is
//! triggered and then waits, up to a deadline, for the connections tracked by
//! a [`ConnectionTracker`] to finish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

/// A cloneable, trigger-once shutdown flag.
///
/// ```rust
/// use keel::shutdown::ShutdownSignal;
///
/// let shutdown = ShutdownSignal::new();
/// let worker = shutdown.clone();
///
/// shutdown.trigger();
/// assert!(worker.is_shutdown());
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    /// A signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            sender,
        }
    }

    /// Fires the signal. Later calls do nothing.
    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.sender.send(());
        }
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Completes once the signal fires, immediately if it already has.
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// A signal fired by SIGTERM or Ctrl-C.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            trigger.trigger();
        });
        signal
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM, waiting for Ctrl-C only"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C, shutting down"),
        Err(e) => warn!(error = %e, "cannot listen for Ctrl-C; shutdown must be triggered"),
    }
}

/// Counts live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl ConnectionTracker {
    /// A tracker with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection until the returned token is dropped.
    #[must_use]
    pub fn acquire(&self) -> ConnectionToken {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionToken {
            active: Arc::clone(&self.active),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Connections currently open.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Completes when no connection is open.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionToken {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}
