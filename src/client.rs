//! Registry client: query, publish and remove service entries.

use std::sync::{Arc, Mutex, MutexGuard};

use http::{Method, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::entry::{NodeAddress, ServiceEntry, Stats};
use crate::error::{Error, RegistryError, Result};
use crate::session::SessionProvider;

const SERVICES_PATH: &str = "/api/services";

/// Client for one service entry in the discovery registry.
///
/// Owns the local copy of the entry. Every mutation of it (address refresh,
/// stat pushes, merging the registry's canonical answer) happens under one
/// lock that is never held across network I/O.
pub struct DiscoveryClient {
    conf: Config,
    sessions: Arc<SessionProvider>,
    entry: Mutex<ServiceEntry>,
}

impl DiscoveryClient {
    /// Create a client publishing through `sessions`.
    ///
    /// The provider must authenticate as the identity in `conf`.
    pub fn new(conf: Config, sessions: Arc<SessionProvider>) -> Result<Self> {
        if sessions.public_key() != conf.public_key() {
            return Err(Error::config(
                "session provider identity does not match config public key",
            ));
        }
        if sessions.registry_addr() != conf.registry_addr() {
            return Err(Error::config(format!(
                "session provider targets {} but config targets {}",
                sessions.registry_addr(),
                conf.registry_addr()
            )));
        }

        let entry = ServiceEntry::from_config(&conf);
        Ok(Self {
            conf,
            sessions,
            entry: Mutex::new(entry),
        })
    }

    /// The immutable config this client publishes.
    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// The shared session provider.
    pub fn sessions(&self) -> &Arc<SessionProvider> {
        &self.sessions
    }

    /// Snapshot of the local entry.
    pub fn entry(&self) -> ServiceEntry {
        self.lock_entry().clone()
    }

    /// Replace the stats carried by the next update.
    pub fn update_stats(&self, stats: Stats) {
        self.lock_entry().stats = Some(stats);
    }

    // A panic while holding the lock cannot leave the entry half-written:
    // every critical section assigns whole fields.
    fn lock_entry(&self) -> MutexGuard<'_, ServiceEntry> {
        self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn url(&self, path: &str, with_type: bool) -> String {
        let mut url = format!("{}{}", self.conf.registry_addr(), path);
        if with_type {
            url.push_str("?type=");
            url.push_str(self.conf.service_type());
        }
        url
    }

    /// Fetch up to `quantity` entries of our service type (`0` = no limit).
    ///
    /// `GET /api/services`, unauthenticated.
    pub async fn query(&self, quantity: usize) -> Result<Vec<ServiceEntry>> {
        let mut url = self.url(SERVICES_PATH, true);
        if quantity != 0 {
            url.push_str(&format!("&quantity={quantity}"));
        }

        let resp = self.sessions.http().get(&url).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(rejection(resp).await);
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Publish the local entry and adopt the registry's canonical version.
    ///
    /// `POST /api/services`, authenticated.
    pub async fn update_entry(&self) -> Result<ServiceEntry> {
        let session = self.sessions.session().await?;

        let body = {
            let mut entry = self.lock_entry();
            entry.address = NodeAddress::new(self.conf.public_key(), self.conf.port());
            serde_json::to_vec(&*entry)?
        };

        let resp = session
            .send(Method::POST, &self.url(SERVICES_PATH, false), Some(body))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(rejection(resp).await);
        }

        let body = resp.bytes().await?;
        let canonical: ServiceEntry = serde_json::from_slice(&body)?;
        *self.lock_entry() = canonical.clone();

        debug!(entry = %String::from_utf8_lossy(&body), "Entry updated");
        Ok(canonical)
    }

    /// Remove our entry from the registry. Missing entries are not an error.
    ///
    /// `DELETE /api/services/{address}`, authenticated.
    pub async fn delete_entry(&self) -> Result<()> {
        let session = self.sessions.session().await?;

        let address = NodeAddress::new(self.conf.public_key(), self.conf.port());
        self.lock_entry().address = address;
        let url = self.url(&format!("{SERVICES_PATH}/{address}"), true);

        let resp = session.send(Method::DELETE, &url, None).await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(%address, "Entry already absent from registry");
                Ok(())
            }
            _ => Err(rejection(resp).await),
        }
    }
}

/// Turn a non-success response into an error, decoding the registry's body.
pub(crate) async fn rejection(resp: reqwest::Response) -> Error {
    let status = resp.status();
    match resp.bytes().await {
        Ok(body) => match RegistryError::from_body(status, &body) {
            Ok(e) => Error::Registry(e),
            Err(e) => e,
        },
        Err(e) => Error::Transport(e),
    }
}
