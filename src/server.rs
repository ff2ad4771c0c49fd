//! HTTP surface: metadata document, health check, satellite registration,
//! and the WebSocket upgrade, all on one listener.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::event::{
    now_ts, Validator, EXERCISE_TEMPLATE_KIND, HEALTH_KIND_MAX, HEALTH_KIND_MIN,
    WORKOUT_RECORD_KIND, WORKOUT_TEMPLATE_KIND,
};
use crate::reference::RelayIdentity;
use crate::satellite::{SatelliteNode, SatelliteRegistry};
use crate::storage::Store;
use crate::subs::SubscriptionRegistry;
use crate::ws;

/// Shared collaborators for every connection and endpoint, built once by
/// the composition root.
pub struct RelayState {
    pub cfg: Settings,
    pub store: Store,
    pub subs: SubscriptionRegistry,
    pub satellites: SatelliteRegistry,
    pub validator: Validator,
    pub identity: RelayIdentity,
    /// Serializes store-then-fan-out so live frames keep global
    /// acceptance order across publishers.
    pub accept_lock: parking_lot::Mutex<()>,
}

/// Build the relay router over the shared state.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/register-satellite", post(register_satellite))
        .with_state(state)
}

/// Serve the combined WebSocket + HTTP listener.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// Metadata document served to plain GETs on `/`.
#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    pubkey: String,
    contact: String,
    software: String,
    version: String,
    supported_kinds: Vec<u32>,
    default_query_limit: usize,
    max_query_limit: usize,
}

/// Kinds advertised in the metadata document; the publish allow-list.
pub fn supported_kinds() -> Vec<u32> {
    let mut kinds = vec![
        WORKOUT_RECORD_KIND,
        EXERCISE_TEMPLATE_KIND,
        WORKOUT_TEMPLATE_KIND,
    ];
    kinds.extend(HEALTH_KIND_MIN..=HEALTH_KIND_MAX);
    kinds
}

/// Serve the relay protocol on upgrade, the metadata document otherwise.
async fn root(ws: Option<WebSocketUpgrade>, State(state): State<Arc<RelayState>>) -> Response {
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| ws::process(socket, state))
            .into_response(),
        None => {
            let info = RelayInfo {
                name: state.cfg.relay_name.clone(),
                description: state.cfg.relay_description.clone(),
                pubkey: state.identity.pubkey().to_string(),
                contact: state.cfg.relay_contact.clone(),
                software: "fitstr".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                supported_kinds: supported_kinds(),
                default_query_limit: state.cfg.default_query_limit,
                max_query_limit: state.cfg.max_query_limit,
            };
            (
                [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
                Json(info),
            )
                .into_response()
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RegisterBody {
    url: String,
    pubkey: String,
    supported_kinds: Vec<u32>,
}

/// Register or refresh a satellite node. Malformed bodies get 400; axum
/// method routing answers non-POST with 405.
async fn register_satellite(State(state): State<Arc<RelayState>>, body: String) -> StatusCode {
    let Ok(body) = serde_json::from_str::<RegisterBody>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    if body.url.is_empty() || body.pubkey.len() != 64 || hex::decode(&body.pubkey).is_err() {
        return StatusCode::BAD_REQUEST;
    }
    let node = SatelliteNode {
        pubkey: body.pubkey,
        url: body.url,
        supported_kinds: body.supported_kinds,
        last_seen: now_ts(),
    };
    match state.satellites.register(node) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "failed to persist satellite registration");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::settings;
    use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use tempfile::TempDir;
    use tokio::task;

    async fn spawn(dir: &TempDir) -> (SocketAddr, Arc<RelayState>, task::JoinHandle<()>) {
        let cfg = settings(dir.path());
        let store = Store::new(cfg.store_root.clone());
        store.init().unwrap();
        let satellites = SatelliteRegistry::load(
            cfg.store_root.join("satellites"),
            cfg.satellite_liveness_seconds,
        )
        .unwrap();
        let validator = Validator {
            clock_skew_future: cfg.clock_skew_future_seconds,
            verify_sig: cfg.verify_sig,
        };
        let identity = RelayIdentity::from_secret_hex(&cfg.relay_secret_key).unwrap();
        let state = Arc::new(RelayState {
            store,
            subs: SubscriptionRegistry::new(),
            satellites,
            validator,
            identity,
            cfg,
            accept_lock: parking_lot::Mutex::new(()),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        let handle = task::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (addr, state, handle)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let dir = TempDir::new().unwrap();
        let (addr, _state, handle) = spawn(&dir).await;
        let url = format!("http://{addr}/healthz");
        let body: Health = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body.status, "ok");
        handle.abort();
    }

    #[tokio::test]
    async fn metadata_document_advertises_kinds_and_limits() {
        let dir = TempDir::new().unwrap();
        let (addr, state, handle) = spawn(&dir).await;
        let url = format!("http://{addr}/");
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(
            resp.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let info: RelayInfo = resp.json().await.unwrap();
        assert_eq!(info.name, "fitstr");
        assert_eq!(info.pubkey, state.identity.pubkey());
        assert!(info.supported_kinds.contains(&1301));
        assert!(info.supported_kinds.contains(&33401));
        assert!(info.supported_kinds.contains(&32048));
        assert!(!info.supported_kinds.contains(&1));
        assert_eq!(info.default_query_limit, state.cfg.default_query_limit);
        assert_eq!(info.max_query_limit, state.cfg.max_query_limit);
        handle.abort();
    }

    #[tokio::test]
    async fn register_satellite_accepts_and_persists() {
        let dir = TempDir::new().unwrap();
        let (addr, state, handle) = spawn(&dir).await;
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "url": "http://sat.example",
            "pubkey": "cc".repeat(32),
            "supported_kinds": [32018, 32020]
        });
        let resp = client
            .post(format!("http://{addr}/register-satellite"))
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let listed = state.satellites.list(now_ts());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "http://sat.example");
        assert!(dir
            .path()
            .join("satellites")
            .join(format!("{}.json", "cc".repeat(32)))
            .exists());
        handle.abort();
    }

    #[tokio::test]
    async fn register_satellite_rejects_malformed() {
        let dir = TempDir::new().unwrap();
        let (addr, _state, handle) = spawn(&dir).await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/register-satellite");

        let resp = client.post(&url).body("not json").send().await.unwrap();
        assert_eq!(resp.status(), 400);

        let missing = serde_json::json!({"url": "http://sat.example"});
        let resp = client
            .post(&url)
            .body(missing.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let bad_pubkey = serde_json::json!({
            "url": "http://sat.example",
            "pubkey": "zz",
            "supported_kinds": []
        });
        let resp = client
            .post(&url)
            .body(bad_pubkey.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        handle.abort();
    }

    #[tokio::test]
    async fn register_satellite_rejects_non_post() {
        let dir = TempDir::new().unwrap();
        let (addr, _state, handle) = spawn(&dir).await;
        let resp = reqwest::get(format!("http://{addr}/register-satellite"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
        handle.abort();
    }

    #[tokio::test]
    async fn serve_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dir = TempDir::new().unwrap();
        let cfg = settings(dir.path());
        let store = Store::new(cfg.store_root.clone());
        store.init().unwrap();
        let satellites = SatelliteRegistry::load(
            cfg.store_root.join("satellites"),
            cfg.satellite_liveness_seconds,
        )
        .unwrap();
        let identity = RelayIdentity::from_secret_hex(&cfg.relay_secret_key).unwrap();
        let state = Arc::new(RelayState {
            store,
            subs: SubscriptionRegistry::new(),
            satellites,
            validator: Validator {
                clock_skew_future: cfg.clock_skew_future_seconds,
                verify_sig: cfg.verify_sig,
            },
            identity,
            cfg,
            accept_lock: parking_lot::Mutex::new(()),
        });
        assert!(serve(addr, state, std::future::pending()).await.is_err());
    }
}
