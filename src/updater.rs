//! Application-facing discovery updaters.
//!
//! Applications that take part in discovery get an [`Updater::Stats`] that
//! keeps their entry registered and lets them push live statistics; every
//! other application gets [`Updater::Null`], whose operations do nothing.

use std::sync::Arc;

use iroh::SecretKey;
use tracing::{debug, trace, warn};

use crate::client::DiscoveryClient;
use crate::config::{Config, HeartbeatConfig};
use crate::entry::Stats;
use crate::error::{Error, Result};
use crate::heartbeat::{Heartbeat, LoopState};
use crate::session::SessionProvider;

/// Key for pushing the number of connected clients.
pub const CONN_COUNT_KEY: &str = "connection-count";

/// Start/stop/stat-push handle for one application's discovery entry.
pub enum Updater {
    /// The application does not participate in discovery.
    Null,
    /// The application's entry is kept alive and carries stats.
    Stats(StatsUpdater),
}

impl Updater {
    /// An updater that does nothing.
    pub fn null() -> Self {
        Self::Null
    }

    /// An updater keeping `client`'s entry alive.
    pub fn stats(client: Arc<DiscoveryClient>, config: HeartbeatConfig) -> Self {
        Self::Stats(StatsUpdater::new(client, config))
    }

    /// Whether this is the no-op variant.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Start keeping the entry registered.
    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Null => Ok(()),
            Self::Stats(u) => u.start().await,
        }
    }

    /// Stop the heartbeat and deregister the entry.
    pub async fn stop(&self) {
        if let Self::Stats(u) = self {
            u.stop().await;
        }
    }

    /// Change a value advertised in the entry.
    ///
    /// Unknown keys are ignored.
    pub fn change_value(&self, name: &str, value: &[u8]) -> Result<()> {
        match self {
            Self::Null => Ok(()),
            Self::Stats(u) => u.change_value(name, value),
        }
    }
}

/// Updater for stat-bearing services.
pub struct StatsUpdater {
    heartbeat: Heartbeat,
}

impl StatsUpdater {
    /// Wrap `client` in an idle heartbeat.
    pub fn new(client: Arc<DiscoveryClient>, config: HeartbeatConfig) -> Self {
        Self {
            heartbeat: Heartbeat::new(client, config),
        }
    }

    /// The underlying discovery client.
    pub fn client(&self) -> &Arc<DiscoveryClient> {
        self.heartbeat.client()
    }

    /// Lifecycle state of the heartbeat.
    pub fn state(&self) -> LoopState {
        self.heartbeat.state()
    }

    /// Establish the registry session and start the heartbeat.
    ///
    /// Authentication failures are returned. Transient failures are left to
    /// the heartbeat, which keeps retrying the registration.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.client().sessions().session().await {
            if !e.is_retryable() {
                return Err(e);
            }
            warn!(error = %e, "Registry session not established yet; heartbeat will retry");
        }
        self.heartbeat.start().await;
        Ok(())
    }

    /// Stop the heartbeat, waiting for deregistration.
    pub async fn stop(&self) {
        self.heartbeat.stop().await;
    }

    /// Apply a stat change to the entry; the next heartbeat publishes it.
    pub fn change_value(&self, name: &str, value: &[u8]) -> Result<()> {
        match name {
            CONN_COUNT_KEY => {
                let connected_clients = parse_count(name, value)?;
                self.client().update_stats(Stats { connected_clients });
                debug!(connected_clients, "Updated discovery stats");
            }
            _ => trace!(key = name, "Ignoring unknown discovery value"),
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &[u8]) -> Result<i64> {
    let invalid = |reason: String| Error::InvalidValue {
        key: key.to_string(),
        reason,
    };
    let text = std::str::from_utf8(value).map_err(|e| invalid(e.to_string()))?;
    let n: i64 = text
        .parse()
        .map_err(|e| invalid(format!("{text:?}: {e}")))?;
    if n < 0 {
        return Err(invalid(format!("{n} is negative")));
    }
    Ok(n)
}

/// Builds updaters for the applications of one node.
///
/// Holds the node's shared session so that all its applications reuse one
/// registry handshake.
pub struct UpdaterFactory {
    target: Option<(Arc<SessionProvider>, SecretKey)>,
    heartbeat: HeartbeatConfig,
}

impl UpdaterFactory {
    /// A factory publishing through `sessions` as the identity `secret_key`.
    pub fn new(
        sessions: Arc<SessionProvider>,
        secret_key: SecretKey,
        heartbeat: HeartbeatConfig,
    ) -> Result<Self> {
        if sessions.public_key() != secret_key.public() {
            return Err(Error::config(
                "session provider identity does not match secret key",
            ));
        }
        Ok(Self {
            target: Some((sessions, secret_key)),
            heartbeat,
        })
    }

    /// A factory for a node without a registry; every updater is a no-op.
    pub fn disabled() -> Self {
        Self {
            target: None,
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Build the updater for an application.
    ///
    /// `service` is the application's service type and port, or `None` for
    /// applications that are not advertised.
    pub fn updater(&self, service: Option<(&str, u16)>) -> Result<Updater> {
        let (Some((sessions, secret_key)), Some((service_type, port))) = (&self.target, service)
        else {
            return Ok(Updater::null());
        };

        let conf = Config::from_secret_key(
            service_type,
            secret_key.clone(),
            port,
            sessions.registry_addr(),
        )?;
        let client = DiscoveryClient::new(conf, Arc::clone(sessions))?;
        Ok(Updater::stats(Arc::new(client), self.heartbeat.clone()))
    }
}
