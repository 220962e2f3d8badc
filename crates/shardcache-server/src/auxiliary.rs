//! Auxiliary (cache node) server
//!
//! Serves one LRU store over HTTP, snapshots it periodically, and hands
//! its contents to the master when shutting down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, FromRef, Path, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};

use shardcache_cluster::{ClusterError, ClusterResult, ClusterTransport, TransportConfig};
use shardcache_core::types::{KeyValue, Mappings, NodeId};
use shardcache_core::ShardCacheConfig;
use shardcache_storage::{LruStore, SnapshotCodec};

use crate::error::{ApiError, ApiResult};
use crate::metrics::{metrics_handler, metrics_middleware, MetricsRecorder, Role};
use crate::shutdown::shutdown_signal;

/// Application state shared across auxiliary handlers
#[derive(Clone)]
pub struct AuxiliaryState {
    pub node_id: NodeId,
    pub store: Arc<LruStore>,
    pub metrics: Arc<MetricsRecorder>,
}

impl FromRef<AuxiliaryState> for Arc<MetricsRecorder> {
    fn from_ref(state: &AuxiliaryState) -> Self {
        Arc::clone(&state.metrics)
    }
}

/// Build the auxiliary HTTP surface
pub fn auxiliary_router(state: AuxiliaryState) -> Router {
    Router::new()
        .route("/data", post(put_data))
        .route("/data/{key}", get(get_data))
        .route("/mappings", get(get_mappings))
        .route("/erase", delete(erase))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .with_state(state)
}

async fn put_data(
    State(state): State<AuxiliaryState>,
    payload: Result<Json<KeyValue>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(pair) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    state.store.put(pair.key, pair.value);
    Ok(StatusCode::OK)
}

async fn get_data(
    State(state): State<AuxiliaryState>,
    Path(key): Path<String>,
) -> ApiResult<Json<KeyValue>> {
    let value = state.store.get(&key)?;
    Ok(Json(KeyValue { key, value }))
}

async fn get_mappings(State(state): State<AuxiliaryState>) -> Json<Mappings> {
    Json(state.store.mappings())
}

async fn erase(State(state): State<AuxiliaryState>) -> StatusCode {
    state.store.erase();
    info!("Cache erased on {}", state.node_id);
    StatusCode::OK
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Auxiliary server
pub struct AuxiliaryServer {
    config: ShardCacheConfig,
}

impl AuxiliaryServer {
    pub fn new(config: ShardCacheConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> ClusterResult<()> {
        self.config.validate_auxiliary()?;

        let node_id = self.config.auxiliary_node_id();
        let aux = &self.config.auxiliary;
        let snapshot_path = aux.snapshot_path(&node_id);

        let store = Arc::new(LruStore::new(aux.capacity));
        load_snapshot(&store, &snapshot_path).await;

        let transport = ClusterTransport::new(TransportConfig {
            timeout: Duration::from_secs(self.config.server.request_timeout_secs),
            ..Default::default()
        })?;

        let metrics = Arc::new(MetricsRecorder::new(Role::Auxiliary));
        let state = AuxiliaryState {
            node_id: node_id.clone(),
            store: Arc::clone(&store),
            metrics,
        };

        let addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("Auxiliary {} listening on http://{}", node_id, addr);

        let stop = CancellationToken::new();
        let server = tokio::spawn({
            let stop = stop.clone();
            let app = auxiliary_router(state);
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { stop.cancelled().await })
                    .await
            }
        });

        if let Err(e) = transport.register(&aux.master_endpoint, &node_id).await {
            error!("Failed to register {} with master: {}", node_id, e);
            stop.cancel();
            let _ = server.await;
            return Err(ClusterError::CoordinationUnavailable(format!(
                "registration with {} failed: {}",
                aux.master_endpoint, e
            )));
        }
        info!("Registered with master {}", aux.master_endpoint);

        let snapshot_stop = stop.child_token();
        let snapshots = spawn_snapshot_task(
            Arc::clone(&store),
            snapshot_path.clone(),
            Duration::from_secs(aux.snapshot_interval_secs.max(1)),
            snapshot_stop.clone(),
        );

        shutdown_signal().await;
        info!("Shutting down auxiliary {}", node_id);

        // No periodic save may overlap the final one
        snapshot_stop.cancel();
        if let Err(e) = snapshots.await {
            error!("Snapshot task failed: {}", e);
        }

        match SnapshotCodec::save(&store, &snapshot_path).await {
            Ok(count) => info!("Saved {} entries to {:?}", count, snapshot_path),
            Err(e) => error!("Final snapshot failed: {}", e),
        }

        if aux.handoff_on_shutdown {
            let mappings = store.mappings();
            let count = mappings.len();
            match transport
                .send_handoff(&aux.master_endpoint, &node_id, &mappings)
                .await
            {
                Ok(()) => info!("Handed off {} keys to {}", count, aux.master_endpoint),
                Err(e) => error!("Handoff to {} failed: {}", aux.master_endpoint, e),
            }
        }

        stop.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server error: {}", e),
            Err(e) => error!("Server task failed: {}", e),
        }

        info!("Auxiliary {} stopped", node_id);
        Ok(())
    }
}

/// Restore `store` from `path`; any failure leaves the store empty
pub async fn load_snapshot(store: &LruStore, path: &std::path::Path) {
    match SnapshotCodec::restore(store, path).await {
        Ok(count) => info!("Loaded {} entries from snapshot", count),
        Err(e) if e.is_missing_or_corrupt_snapshot() => {
            warn!("Starting empty: {}", e);
        }
        Err(e) => error!("Failed to load snapshot {:?}: {}", path, e),
    }
}

/// Save `store` to `path` every `interval` until `stop` fires
pub fn spawn_snapshot_task(
    store: Arc<LruStore>,
    path: PathBuf,
    interval: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match SnapshotCodec::save(&store, &path).await {
                Ok(count) => debug!("Snapshot of {} entries written", count),
                Err(e) => error!("Snapshot to {:?} failed: {}", path, e),
            }
        }

        debug!("Snapshot task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn state(capacity: usize) -> AuxiliaryState {
        AuxiliaryState {
            node_id: "aux1:3001".to_string(),
            store: Arc::new(LruStore::new(capacity)),
            metrics: Arc::new(MetricsRecorder::detached(Role::Auxiliary)),
        }
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let state = state(4);
        let app = auxiliary_router(state.clone());

        let response = app
            .clone()
            .oneshot(post_json("/data", r#"{"key":"foo","value":"bar"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/data/foo")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let pair: KeyValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(pair, KeyValue::new("foo", "bar"));
    }

    #[tokio::test]
    async fn test_miss_is_404() {
        let app = auxiliary_router(state(4));
        let response = app.oneshot(get("/data/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let app = auxiliary_router(state(4));
        let response = app.oneshot(post_json("/data", "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mappings_and_erase() {
        let state = state(4);
        state.store.put("a", "1");
        state.store.put("b", "2");
        let app = auxiliary_router(state.clone());

        let response = app.clone().oneshot(get("/mappings")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mappings: Mappings = serde_json::from_slice(&body).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings.get("a").map(String::as_str), Some("1"));

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/erase")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let app = auxiliary_router(state(1));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_eviction_visible_over_http() {
        let state = state(3);
        let app = auxiliary_router(state.clone());

        for key in ["A", "B", "C"] {
            let body = format!(r#"{{"key":"{}","value":"v"}}"#, key);
            app.clone().oneshot(post_json("/data", &body)).await.unwrap();
        }
        app.clone().oneshot(get("/data/A")).await.unwrap();
        app.clone()
            .oneshot(post_json("/data", r#"{"key":"D","value":"v"}"#))
            .await
            .unwrap();

        let response = app.oneshot(get("/data/B")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.store.len(), 3);
    }

    #[tokio::test]
    async fn test_reserved_characters_in_keys_over_transport() {
        use shardcache_cluster::{CacheTransport, ClusterTransport, TransportConfig};

        let state = state(8);
        state.store.put("a/b", "slash-value");
        state.store.put("x", "x-value");
        state.store.put("x?y", "query-value");
        state.store.put("x#y", "fragment-value");
        state.store.put("100%", "percent-value");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = listener.local_addr().unwrap().to_string();
        let app = auxiliary_router(state);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let transport = ClusterTransport::new(TransportConfig::default()).unwrap();
        let expected = [
            ("a/b", Some("slash-value")),
            ("x?y", Some("query-value")),
            ("x#y", Some("fragment-value")),
            ("100%", Some("percent-value")),
            ("x", Some("x-value")),
            ("a", None),
        ];
        for (key, value) in expected {
            let found = transport.get(&node, key).await.unwrap();
            assert_eq!(found.as_deref(), value, "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_snapshot_task_writes_and_load_restores() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aux1_3001-data.dat");

        let store = Arc::new(LruStore::new(8));
        store.put("foo", "bar");

        let stop = CancellationToken::new();
        let task = spawn_snapshot_task(
            Arc::clone(&store),
            path.clone(),
            Duration::from_millis(10),
            stop.clone(),
        );

        for _ in 0..200 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.cancel();
        task.await.unwrap();

        let restored = LruStore::new(8);
        load_snapshot(&restored, &path).await;
        assert_eq!(restored.get("foo").unwrap(), "bar");
    }

    #[tokio::test]
    async fn test_load_snapshot_tolerates_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let store = LruStore::new(2);

        load_snapshot(&store, &dir.path().join("absent.dat")).await;
        assert!(store.is_empty());

        let corrupt = dir.path().join("corrupt.dat");
        std::fs::write(&corrupt, b"]]").unwrap();
        load_snapshot(&store, &corrupt).await;
        assert!(store.is_empty());
    }
}
