//! Manages the life cycle of the process: waits for a reason to
//! stop, then tells everything that is idling to wrap up.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use anyhow::Context;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};

/// ShutdownSubscription can be used by code that is idling.
/// Select on your work and ShutdownSubscription::shutting_down
/// to wake up when the process is about to shut down.
#[derive(Clone, Debug)]
pub struct ShutdownSubscription {
    rx: WatchReceiver<bool>,
}

impl ShutdownSubscription {
    /// Await the shutdown of the process
    pub async fn shutting_down(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // Err means the LifeCycle went away, which is as good as a shutdown
        self.rx.changed().await.ok();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Handle that lets any task ask for the process to stop
#[derive(Clone, Debug)]
pub struct ShutdownRequester {
    tx: MPSCSender<()>,
}

impl ShutdownRequester {
    pub fn request_shutdown(&self) {
        tracing::debug!("shutdown has been requested");
        // A full channel means a request is already pending
        self.tx.try_send(()).ok();
    }
}

pub struct LifeCycle {
    stopping_tx: WatchSender<bool>,
    stopping_rx: WatchReceiver<bool>,
    request_shutdown_tx: MPSCSender<()>,
    request_shutdown_rx: MPSCReceiver<()>,
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifeCycle {
    pub fn new() -> Self {
        let (stopping_tx, stopping_rx) = tokio::sync::watch::channel(false);
        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        Self {
            stopping_tx,
            stopping_rx,
            request_shutdown_tx,
            request_shutdown_rx,
        }
    }

    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.stopping_rx.clone(),
        }
    }

    pub fn requester(&self) -> ShutdownRequester {
        ShutdownRequester {
            tx: self.request_shutdown_tx.clone(),
        }
    }

    /// Wait for a signal or a shutdown request, then propagate
    /// that state to the subscribers.
    pub async fn wait_for_shutdown(&mut self) -> anyhow::Result<()> {
        tracing::debug!("Waiting for interrupt");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).context("listen for SIGTERM")?;
        let mut sig_hup =
            tokio::signal::unix::signal(SignalKind::hangup()).context("listen for SIGHUP")?;

        tokio::select! {
            _ = sig_term.recv() => {}
            _ = sig_hup.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::info!("Shutdown requested; no longer accepting connections");
        self.stopping_tx.send_replace(true);
        Ok(())
    }
}
