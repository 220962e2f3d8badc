//! Master (routing) server
//!
//! Handles:
//! - Routing client reads and writes to the owning auxiliary
//! - Graceful-leave handoffs from departing auxiliaries
//! - Registration of auxiliaries that join at runtime
//! - Cluster membership inspection

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, FromRef, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};

use shardcache_cluster::{
    validate_node_id, CacheTransport, ClusterCoordinator, ClusterRegistry, ClusterResult,
    ClusterTransport, CoordinationService, DistributedLock, KeyValue, Mappings,
    MembershipTracker, MemoryCoordinator, NodeId, NodeLiveness, TransportConfig,
    AUX_SERVER_HEADER,
};
use shardcache_core::ShardCacheConfig;

use crate::error::{ApiError, ApiResult};
use crate::metrics::{metrics_handler, metrics_middleware, MetricsRecorder, Role};
use crate::shutdown::shutdown_signal;

/// Application state shared across master handlers
#[derive(Clone)]
pub struct MasterState {
    pub coordinator: Arc<ClusterCoordinator>,
    pub registry: Option<Arc<ClusterRegistry>>,
    pub tracker: Arc<MembershipTracker>,
    pub metrics: Arc<MetricsRecorder>,
}

impl FromRef<MasterState> for Arc<MetricsRecorder> {
    fn from_ref(state: &MasterState) -> Self {
        Arc::clone(&state.metrics)
    }
}

/// Build the master HTTP surface
pub fn master_router(state: MasterState) -> Router {
    Router::new()
        .route("/data", post(put_data))
        .route("/data/{key}", get(get_data))
        .route("/rebalance-dead-aux", post(rebalance_dead_aux))
        .route("/cluster/register", post(register_auxiliary))
        .route("/cluster/nodes", get(cluster_nodes))
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
    State(state): State<MasterState>,
    payload: Result<Json<KeyValue>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(pair) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let node = state.coordinator.route(&pair.key)?;
    debug!("PUT {} -> {}", pair.key, node);
    state.coordinator.transport().put(&node, &pair).await?;
    Ok(StatusCode::OK)
}

async fn get_data(
    State(state): State<MasterState>,
    Path(key): Path<String>,
) -> ApiResult<Json<KeyValue>> {
    let node = state.coordinator.route(&key)?;
    debug!("GET {} -> {}", key, node);
    match state.coordinator.transport().get(&node, &key).await? {
        Some(value) => Ok(Json(KeyValue { key, value })),
        None => Err(ApiError::not_found(format!("Key not found: {}", key))),
    }
}

async fn rebalance_dead_aux(
    State(state): State<MasterState>,
    headers: HeaderMap,
    payload: Result<Json<Mappings>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let node = headers
        .get(AUX_SERVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing {} header", AUX_SERVER_HEADER)))?
        .to_string();
    let Json(mappings) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    info!("Handoff of {} keys from {}", mappings.len(), node);
    state
        .coordinator
        .handle_handoff(&node, mappings)
        .await?
        .detach();
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    node: NodeId,
}

async fn register_auxiliary(
    State(state): State<MasterState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    validate_node_id(&request.node).map_err(|e| ApiError::bad_request(e.to_string()))?;

    if let Some(registry) = &state.registry {
        registry.register_auxiliary(&request.node).await?;
    }
    if state.tracker.track(request.node.clone()) {
        info!("Auxiliary {} registered", request.node);
    }
    Ok(StatusCode::OK)
}

async fn cluster_nodes(State(state): State<MasterState>) -> Json<Vec<NodeLiveness>> {
    Json(state.coordinator.nodes())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Master server
pub struct MasterServer {
    config: ShardCacheConfig,
}

impl MasterServer {
    pub fn new(config: ShardCacheConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> ClusterResult<()> {
        self.config.validate_master()?;
        let master = &self.config.master;
        let cancel = CancellationToken::new();

        let transport: Arc<dyn CacheTransport> = Arc::new(ClusterTransport::new(TransportConfig {
            timeout: Duration::from_secs(self.config.server.request_timeout_secs),
            ..Default::default()
        })?);

        let mut builder = ClusterCoordinator::builder()
            .replicas(master.replicas)
            .transport(Arc::clone(&transport))
            .backup_path(master.backup_path.clone())
            .static_nodes(master.aux_servers.clone())
            .max_rebalance_workers(master.rebalance_workers);

        let mut registry = None;
        if self.config.coordination.enabled {
            let coordination = MemoryCoordinator::new();
            let session: Arc<dyn CoordinationService> = Arc::new(coordination.session());
            let reg = Arc::new(ClusterRegistry::new(session, &self.config.coordination));
            reg.register_master(&local_hostname()).await?;

            let lock_session: Arc<dyn CoordinationService> = Arc::new(coordination.session());
            let lock = DistributedLock::new(lock_session, &self.config.coordination.lock_path)
                .with_cancellation(cancel.clone());

            builder = builder.lock(Arc::new(lock)).registry(Arc::clone(&reg));
            registry = Some(reg);
        }

        let coordinator = Arc::new(builder.build()?);

        let (event_tx, event_rx) = mpsc::channel(256);
        let tracker = Arc::new(MembershipTracker::new(
            transport,
            Duration::from_secs(master.health_check_interval_secs.max(1)),
            event_tx,
        ));
        tracker.start(master.aux_servers.clone());

        tokio::spawn(Arc::clone(&coordinator).run(event_rx, cancel.clone()));

        if let Some(registry) = &registry {
            spawn_registration_watch(registry, Arc::clone(&tracker), cancel.clone()).await?;
            let removals = registry.removal_inbox(cancel.clone())?;
            tokio::spawn(Arc::clone(&coordinator).run_peer_removals(removals, cancel.clone()));
        }

        let state = MasterState {
            coordinator,
            registry,
            tracker: Arc::clone(&tracker),
            metrics: Arc::new(MetricsRecorder::new(Role::Master)),
        };

        let addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!("Master listening on http://{}", addr);
        info!("Static auxiliaries: {:?}", master.aux_servers);

        let shutdown = {
            let cancel = cancel.clone();
            let tracker = Arc::clone(&tracker);
            async move {
                shutdown_signal().await;
                info!("Shutting down master");
                tracker.stop();
                cancel.cancel();
            }
        };

        let result = axum::serve(listener, master_router(state))
            .with_graceful_shutdown(shutdown)
            .await;

        // Stop background loops if serving failed on its own
        cancel.cancel();
        tracker.stop();

        if let Err(e) = result {
            error!("Server error: {}", e);
            return Err(e.into());
        }

        info!("Master stopped");
        Ok(())
    }
}

/// Start probing every auxiliary that registers with the coordination
/// service, now or later
async fn spawn_registration_watch(
    registry: &ClusterRegistry,
    tracker: Arc<MembershipTracker>,
    cancel: CancellationToken,
) -> ClusterResult<()> {
    let mut updates = registry.watch_auxiliaries(cancel).await?;

    tokio::spawn(async move {
        while let Some(nodes) = updates.recv().await {
            for node in nodes {
                if validate_node_id(&node).is_err() {
                    warn!("Ignoring malformed registration {}", node);
                    continue;
                }
                if tracker.track(node.clone()) {
                    info!("Discovered auxiliary {}", node);
                }
            }
        }
        debug!("Registration watch stopped");
    });

    Ok(())
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
