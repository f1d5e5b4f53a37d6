//! Registration and heartbeat configuration.

use std::time::Duration;

use iroh::{PublicKey, SecretKey};

use crate::error::{Error, Result};

/// Service type of a plain visor node.
pub const SERVICE_TYPE_VISOR: &str = "visor";
/// Service type of a visor advertising itself as publicly reachable.
pub const SERVICE_TYPE_PUBLIC_VISOR: &str = "public-visor";
/// Service type of a proxy server application.
pub const SERVICE_TYPE_PROXY: &str = "proxy";
/// Service type of a VPN server application.
pub const SERVICE_TYPE_VPN: &str = "vpn";

/// Whether entries of this service type carry [`Stats`](crate::Stats).
///
/// Node-level entries describe the node itself and have no clients to count.
pub fn is_stat_bearing(service_type: &str) -> bool {
    service_type != SERVICE_TYPE_VISOR && service_type != SERVICE_TYPE_PUBLIC_VISOR
}

/// Immutable registration config, assembled by the hosting application.
#[derive(Debug, Clone)]
pub struct Config {
    service_type: String,
    public_key: PublicKey,
    secret_key: SecretKey,
    port: u16,
    registry_addr: String,
}

impl Config {
    /// Build a config, checking that the identity keys belong together.
    pub fn new(
        service_type: impl Into<String>,
        secret_key: SecretKey,
        public_key: PublicKey,
        port: u16,
        registry_addr: impl Into<String>,
    ) -> Result<Self> {
        let service_type = service_type.into();
        if service_type.is_empty() {
            return Err(Error::config("service type must not be empty"));
        }
        if secret_key.public() != public_key {
            return Err(Error::config("public key does not match secret key"));
        }
        let registry_addr = registry_addr.into().trim_end_matches('/').to_string();
        if registry_addr.is_empty() {
            return Err(Error::config("registry address must not be empty"));
        }

        Ok(Self {
            service_type,
            public_key,
            secret_key,
            port,
            registry_addr,
        })
    }

    /// Build a config deriving the public key from the secret key.
    pub fn from_secret_key(
        service_type: impl Into<String>,
        secret_key: SecretKey,
        port: u16,
        registry_addr: impl Into<String>,
    ) -> Result<Self> {
        let public_key = secret_key.public();
        Self::new(service_type, secret_key, public_key, port, registry_addr)
    }

    /// Service type tag, e.g. `"proxy"`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Public identity key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Secret identity key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Port the service listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registry base address without a trailing slash.
    pub fn registry_addr(&self) -> &str {
        &self.registry_addr
    }
}

/// Timing of the heartbeat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between periodic re-publications. Default: 30 seconds.
    pub update_interval: Duration,
    /// Delay between attempts of the initial registration. Default: 10 seconds.
    pub retry_delay: Duration,
    /// Deadline for the final deregistration. Default: 10 seconds.
    pub delete_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(10),
            delete_timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    /// Set the periodic update interval.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Set the initial-registration retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the deregistration deadline.
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }
}
