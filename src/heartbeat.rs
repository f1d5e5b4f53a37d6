//! Background heartbeat keeping a registry entry alive.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::DiscoveryClient;
use crate::config::HeartbeatConfig;
use crate::error::Error;

/// Lifecycle state of a [`Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No task is running.
    Idle,
    /// The heartbeat task is running.
    Running,
    /// Cancellation was signalled and the task is unwinding.
    Stopping,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically re-publishes the entry of a [`DiscoveryClient`].
///
/// `start` and `stop` are idempotent. `stop` returns only once the task has
/// exited and the entry has been deregistered (or the attempt timed out).
pub struct Heartbeat {
    client: Arc<DiscoveryClient>,
    config: HeartbeatConfig,
    control: Mutex<Option<Running>>,
    state: std::sync::Mutex<LoopState>,
}

impl Heartbeat {
    /// Create an idle heartbeat for `client`.
    pub fn new(client: Arc<DiscoveryClient>, config: HeartbeatConfig) -> Self {
        Self {
            client,
            config,
            control: Mutex::new(None),
            state: std::sync::Mutex::new(LoopState::Idle),
        }
    }

    /// The client whose entry is kept alive.
    pub fn client(&self) -> &Arc<DiscoveryClient> {
        &self.client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Spawn the heartbeat task. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if control.is_some() {
            debug!("Discovery heartbeat already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let client = Arc::clone(&self.client);
        let config = self.config.clone();
        let handle = tokio::spawn(run(client, config, shutdown_rx));

        *control = Some(Running {
            shutdown_tx,
            handle,
        });
        self.set_state(LoopState::Running);
    }

    /// Cancel the heartbeat task and wait for it to exit.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(running) = control.take() else {
            return;
        };

        self.set_state(LoopState::Stopping);
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            error!(error = %e, "Discovery heartbeat task failed");
        }
        self.set_state(LoopState::Idle);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        // The detached task still deregisters once it sees the signal.
        if let Some(running) = self.control.get_mut().take() {
            let _ = running.shutdown_tx.send(());
        }
    }
}

enum Outcome {
    Cancelled,
    Terminated,
}

async fn run(
    client: Arc<DiscoveryClient>,
    config: HeartbeatConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let address = client.entry().address;
    info!(
        %address,
        service_type = client.config().service_type(),
        "Starting discovery heartbeat"
    );

    if let Outcome::Terminated = heartbeat(&client, &config, &mut shutdown_rx).await {
        // Nothing more to publish; keep the task alive so stop() still deregisters.
        let _ = shutdown_rx.recv().await;
    }

    info!(%address, "Discovery heartbeat shutting down");
    match time::timeout(config.delete_timeout, client.delete_entry()).await {
        Ok(Ok(())) => debug!(%address, "Entry deleted from discovery"),
        Ok(Err(e)) => warn!(%address, error = %e, "Failed to delete entry from discovery"),
        Err(_) => warn!(
            %address,
            timeout = ?config.delete_timeout,
            "Timed out deleting entry from discovery"
        ),
    }
}

async fn heartbeat(
    client: &DiscoveryClient,
    config: &HeartbeatConfig,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Outcome {
    // Initial registration: retried until it succeeds.
    loop {
        let result = tokio::select! {
            res = client.update_entry() => res,
            _ = shutdown_rx.recv() => return Outcome::Cancelled,
        };

        match result {
            Ok(entry) => {
                info!(address = %entry.address, "Registered entry in discovery");
                break;
            }
            Err(e) if !e.is_retryable() => {
                log_terminal(&e);
                return Outcome::Terminated;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_in = ?config.retry_delay,
                    "Failed to register entry in discovery. Retrying..."
                );
                tokio::select! {
                    _ = time::sleep(config.retry_delay) => {}
                    _ = shutdown_rx.recv() => return Outcome::Cancelled,
                }
            }
        }
    }

    let mut interval = time::interval_at(
        Instant::now() + config.update_interval,
        config.update_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.recv() => return Outcome::Cancelled,
        }

        let result = tokio::select! {
            res = client.update_entry() => res,
            _ = shutdown_rx.recv() => return Outcome::Cancelled,
        };

        match result {
            Ok(entry) => debug!(stats = ?entry.stats, "Entry refreshed"),
            Err(e) if !e.is_retryable() => {
                log_terminal(&e);
                return Outcome::Terminated;
            }
            // Stale entries heal on the next tick.
            Err(e) => warn!(error = %e, "Failed to refresh entry in discovery"),
        }
    }
}

fn log_terminal(e: &Error) {
    if e.is_unreachable() {
        error!(
            error = %e,
            "Unable to register service as it's unreachable from the registry; giving up"
        );
    } else {
        error!(error = %e, "Discovery registration rejected permanently; giving up");
    }
}
