//! In-process mock of the discovery registry.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use ed25519_dalek::Signature;
use mesh_discovery::{Config, PublicKey, SecretKey, SessionProvider};
use serde_json::{json, Value};

/// How the registry answers a POST.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Accept,
    Unreachable,
    Fail(StatusCode),
    Garbage,
}

#[derive(Debug, Clone)]
pub struct Post {
    pub at: Instant,
    pub body: Value,
    pub nonce: u64,
}

/// A signed request the registry accepted.
#[derive(Debug, Clone)]
pub struct Signed {
    pub method: Method,
    pub nonce: u64,
    pub body_len: usize,
}

#[derive(Default)]
pub struct RegistryState {
    pub posts: Mutex<Vec<Post>>,
    pub deletes: Mutex<Vec<(String, HashMap<String, String>)>>,
    pub queries: Mutex<Vec<HashMap<String, String>>>,
    pub nonce_calls: AtomicUsize,
    pub nonce_failures: AtomicUsize,
    pub signed: Mutex<Vec<Signed>>,
    pub rejected: Mutex<Vec<String>>,

    pub script: Mutex<VecDeque<Reply>>,
    pub fallback: Mutex<Option<Reply>>,
    pub canonical_version: Mutex<Option<String>>,
    pub post_delay: Mutex<Option<Duration>>,
    pub delete_delay: Mutex<Option<Duration>>,
    pub delete_status: Mutex<Option<StatusCode>>,
    pub nonce_delay: Mutex<Option<Duration>>,
    pub reject_auth: Mutex<bool>,
    pub reject_signatures: Mutex<bool>,
    /// Nonce the next signed request must carry.
    pub next_nonce: Mutex<u64>,
    pub services: Mutex<Vec<Value>>,
    pub query_error: Mutex<Option<(StatusCode, String)>>,
}

pub struct MockRegistry {
    pub url: String,
    pub state: Arc<RegistryState>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let state = Arc::new(RegistryState::default());
        let app = Router::new()
            .route("/api/services", get(query).post(update))
            .route("/api/services/:address", delete(remove))
            .route("/security/nonces/:pk", get(nonce))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Answer POSTs from `script` first, then with `fallback` forever.
    pub fn script(&self, script: impl IntoIterator<Item = Reply>, fallback: Reply) {
        *self.state.script.lock().unwrap() = script.into_iter().collect();
        *self.state.fallback.lock().unwrap() = Some(fallback);
    }

    pub fn posts(&self) -> Vec<Post> {
        self.state.posts.lock().unwrap().clone()
    }

    pub fn post_count(&self) -> usize {
        self.state.posts.lock().unwrap().len()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state
            .deletes
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn nonce_calls(&self) -> usize {
        self.state.nonce_calls.load(Ordering::SeqCst)
    }

    /// Reasons signed requests were refused with `401`.
    pub fn rejected(&self) -> Vec<String> {
        self.state.rejected.lock().unwrap().clone()
    }

    pub fn signed(&self) -> Vec<Signed> {
        self.state.signed.lock().unwrap().clone()
    }

    /// Advance the expected nonce behind the client's back.
    pub fn skip_nonces(&self, n: u64) {
        *self.state.next_nonce.lock().unwrap() += n;
    }

    pub fn config(&self, service_type: &str, seed: u8, port: u16) -> Config {
        Config::from_secret_key(service_type, secret_key(seed), port, self.url.clone()).unwrap()
    }

    pub fn sessions(&self, seed: u8) -> Arc<SessionProvider> {
        Arc::new(SessionProvider::new(self.url.clone(), secret_key(seed)).unwrap())
    }
}

pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::from_bytes(&[seed; 32])
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "code": status.as_u16(), "message": message } })),
    )
        .into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Check the signature over `body ++ nonce` and consume the expected nonce.
fn authenticate(
    state: &RegistryState,
    method: Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<u64, Response> {
    let verdict = (|| {
        if *state.reject_signatures.lock().unwrap() {
            return Err("signatures disabled".to_string());
        }
        let public = header(headers, "SW-Public").ok_or("missing SW-Public")?;
        let nonce: u64 = header(headers, "SW-Nonce")
            .and_then(|v| v.parse().ok())
            .ok_or("missing SW-Nonce")?;
        let sig = header(headers, "SW-Sig").ok_or("missing SW-Sig")?;

        let mut key = [0u8; 32];
        hex::decode_to_slice(public, &mut key).map_err(|e| e.to_string())?;
        let key = PublicKey::from_bytes(&key).map_err(|e| e.to_string())?;
        let sig = hex::decode(sig).map_err(|e| e.to_string())?;
        let sig = Signature::from_slice(&sig).map_err(|e| e.to_string())?;

        let mut payload = body.to_vec();
        payload.extend_from_slice(nonce.to_string().as_bytes());
        key.verify(&payload, &sig).map_err(|e| e.to_string())?;

        let mut expected = state.next_nonce.lock().unwrap();
        if nonce != *expected {
            return Err(format!("nonce {nonce}, expected {}", *expected));
        }
        *expected += 1;
        Ok(nonce)
    })();

    match verdict {
        Ok(nonce) => {
            state.signed.lock().unwrap().push(Signed {
                method,
                nonce,
                body_len: body.len(),
            });
            Ok(nonce)
        }
        Err(reason) => {
            state.rejected.lock().unwrap().push(reason);
            Err(StatusCode::UNAUTHORIZED.into_response())
        }
    }
}

async fn nonce(State(state): State<Arc<RegistryState>>, Path(pk): Path<String>) -> Response {
    state.nonce_calls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.nonce_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if *state.reject_auth.lock().unwrap() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let failing = state
        .nonce_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "nonce store unavailable");
    }
    let next_nonce = *state.next_nonce.lock().unwrap();
    Json(json!({ "edge": pk, "next_nonce": next_nonce })).into_response()
}

async fn query(
    State(state): State<Arc<RegistryState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.queries.lock().unwrap().push(params.clone());
    if let Some((status, message)) = state.query_error.lock().unwrap().clone() {
        return (status, Json(json!({ "error": message }))).into_response();
    }

    let services: Vec<Value> = state
        .services
        .lock()
        .unwrap()
        .iter()
        .filter(|s| params.get("type").map(String::as_str) == s["type"].as_str())
        .cloned()
        .collect();
    let quantity = params
        .get("quantity")
        .and_then(|q| q.parse().ok())
        .unwrap_or(services.len());
    Json(services.into_iter().take(quantity).collect::<Vec<_>>()).into_response()
}

async fn update(
    State(state): State<Arc<RegistryState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let nonce = match authenticate(&state, Method::POST, &headers, &body) {
        Ok(nonce) => nonce,
        Err(resp) => return resp,
    };
    let mut entry: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return error_body(StatusCode::BAD_REQUEST, "bad entry"),
    };

    state.posts.lock().unwrap().push(Post {
        at: Instant::now(),
        body: entry.clone(),
        nonce,
    });

    let delay = *state.post_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let reply = {
        let next = state.script.lock().unwrap().pop_front();
        next.or(*state.fallback.lock().unwrap())
            .unwrap_or(Reply::Accept)
    };

    match reply {
        Reply::Accept => {
            if let Some(version) = state.canonical_version.lock().unwrap().clone() {
                entry["version"] = Value::String(version);
            }
            Json(entry).into_response()
        }
        Reply::Unreachable => error_body(StatusCode::UNPROCESSABLE_ENTITY, "visor is unreachable"),
        Reply::Fail(status) => error_body(status, "temporary failure"),
        Reply::Garbage => (StatusCode::OK, "not json").into_response(),
    }
}

async fn remove(
    State(state): State<Arc<RegistryState>>,
    headers: HeaderMap,
    Path(address): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if let Err(resp) = authenticate(&state, Method::DELETE, &headers, &body) {
        return resp;
    }
    state.deletes.lock().unwrap().push((address, params));

    let delay = *state.delete_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    match *state.delete_status.lock().unwrap() {
        Some(StatusCode::NOT_FOUND) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "entry not found" })),
        )
            .into_response(),
        Some(status) => error_body(status, "delete failed"),
        None => StatusCode::OK.into_response(),
    }
}
