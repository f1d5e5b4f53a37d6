//! Authenticated registry sessions.
//!
//! A [`SessionProvider`] is built once per node identity and shared (behind an
//! `Arc`) by every [`DiscoveryClient`](crate::DiscoveryClient) of that
//! identity. The handshake runs lazily on first use and its result is
//! memoized, so all registry operations reuse the same [`AuthSession`].

use std::sync::Arc;
use std::time::Duration;

use http::{header, Method, StatusCode};
use iroh::{PublicKey, SecretKey};
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::client::rejection;
use crate::error::{Error, Result};

/// Header carrying the hex-encoded public key of the caller.
pub const HEADER_PUBLIC_KEY: &str = "SW-Public";
/// Header carrying the nonce the request was signed with.
pub const HEADER_NONCE: &str = "SW-Nonce";
/// Header carrying the hex-encoded ed25519 signature.
pub const HEADER_SIGNATURE: &str = "SW-Sig";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lazily establishes and memoizes the authenticated session of one identity.
pub struct SessionProvider {
    http: reqwest::Client,
    registry_addr: String,
    secret_key: SecretKey,
    session: OnceCell<Arc<AuthSession>>,
}

impl SessionProvider {
    /// Create a provider with its own HTTP client.
    pub fn new(registry_addr: impl Into<String>, secret_key: SecretKey) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(http, registry_addr, secret_key))
    }

    /// Create a provider reusing an existing HTTP client.
    pub fn with_client(
        http: reqwest::Client,
        registry_addr: impl Into<String>,
        secret_key: SecretKey,
    ) -> Self {
        Self {
            http,
            registry_addr: registry_addr.into().trim_end_matches('/').to_string(),
            secret_key,
            session: OnceCell::new(),
        }
    }

    /// Identity this provider authenticates as.
    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public()
    }

    /// Registry this provider authenticates against.
    pub fn registry_addr(&self) -> &str {
        &self.registry_addr
    }

    /// The plain HTTP client, for unauthenticated requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Whether the handshake has already completed.
    pub fn is_established(&self) -> bool {
        self.session.initialized()
    }

    /// Return the session, running the handshake if this is the first use.
    ///
    /// Concurrent first callers share a single handshake. A failed handshake
    /// is returned as-is and leaves the provider empty, so a later call
    /// starts a fresh one.
    pub async fn session(&self) -> Result<Arc<AuthSession>> {
        self.session
            .get_or_try_init(|| async {
                AuthSession::handshake(self.http.clone(), &self.registry_addr, &self.secret_key)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned()
    }
}

#[derive(Deserialize)]
struct NonceResponse {
    edge: String,
    next_nonce: u64,
}

/// An authenticated transport to the registry.
///
/// Every request is signed over its body and the current nonce. Requests on
/// one session are serialized because each consumes a nonce.
///
/// A nonce is spent as soon as its request is built. A request that is
/// cancelled or loses its response may still have been counted by the
/// registry, so reusing the nonce would be rejected. When the registry does
/// reject a nonce the session asks for the current one and retries once.
pub struct AuthSession {
    http: reqwest::Client,
    secret_key: SecretKey,
    public_hex: String,
    nonce_url: String,
    nonce: Mutex<u64>,
}

impl AuthSession {
    async fn handshake(
        http: reqwest::Client,
        registry_addr: &str,
        secret_key: &SecretKey,
    ) -> Result<Self> {
        let public_hex = hex::encode(secret_key.public().as_bytes());
        let nonce_url = format!("{registry_addr}/security/nonces/{public_hex}");
        debug!(url = %nonce_url, "Starting registry handshake");

        let next_nonce = fetch_nonce(&http, &nonce_url, &public_hex).await?;
        info!(next_nonce, "Registry session established");
        Ok(Self {
            http,
            secret_key: secret_key.clone(),
            public_hex,
            nonce_url,
            nonce: Mutex::new(next_nonce),
        })
    }

    /// Nonce the next request will be signed with.
    pub async fn next_nonce(&self) -> u64 {
        *self.nonce.lock().await
    }

    /// Send a signed request.
    ///
    /// Returns the raw response for any status other than `401`. A `401` is
    /// retried once with a freshly fetched nonce and reported as
    /// [`Error::Auth`] if the registry still refuses.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let mut nonce = self.nonce.lock().await;
        let body = body.unwrap_or_default();

        let used = *nonce;
        *nonce += 1;
        let resp = self.signed(method.clone(), url, &body, used).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let fresh = fetch_nonce(&self.http, &self.nonce_url, &self.public_hex).await?;
        warn!(rejected = used, fresh, "Registry rejected nonce, resynchronizing");
        *nonce = fresh + 1;
        let resp = self.signed(method, url, &body, fresh).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::auth(format!(
                "registry rejected signature with nonce {used} and again with {fresh}"
            )));
        }
        Ok(resp)
    }

    fn signed(
        &self,
        method: Method,
        url: &str,
        body: &[u8],
        nonce: u64,
    ) -> reqwest::RequestBuilder {
        let mut payload = body.to_vec();
        payload.extend_from_slice(nonce.to_string().as_bytes());
        let signature = hex::encode(self.secret_key.sign(&payload).to_bytes());

        let req = self
            .http
            .request(method, url)
            .header(HEADER_PUBLIC_KEY, &self.public_hex)
            .header(HEADER_NONCE, nonce.to_string())
            .header(HEADER_SIGNATURE, signature);
        if body.is_empty() {
            req
        } else {
            req.header(header::CONTENT_TYPE, "application/json")
                .body(body.to_vec())
        }
    }
}

/// Ask the registry for the nonce our next request must carry.
async fn fetch_nonce(http: &reqwest::Client, url: &str, public_hex: &str) -> Result<u64> {
    let resp = http.get(url).send().await?;
    match resp.status() {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(Error::auth(format!(
                "registry refused identity {public_hex}: {}",
                resp.status()
            )));
        }
        _ => return Err(rejection(resp).await),
    }

    let body = resp.bytes().await?;
    let nonce: NonceResponse = serde_json::from_slice(&body)?;
    if !nonce.edge.eq_ignore_ascii_case(public_hex) {
        return Err(Error::auth(format!(
            "nonce issued for {} instead of {public_hex}",
            nonce.edge
        )));
    }
    Ok(nonce.next_nonce)
}
