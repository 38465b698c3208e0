use crate::config::WatchConfig;
use crate::scraper::{cache_label, ScrapeTarget, ScrapeWorkerFactory};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cachewatch_poller::{ClusterDirectory, NodeInfo, PollerError, PollerManager, WorkerFactory};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

/// Errors returned by the REST handlers; all map to 503.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The cache's poller manager could not be initialised.
    #[error("poller for cache {cache} unavailable: {source}")]
    Poller {
        /// Cache the request was for.
        cache: String,
        /// Underlying poller failure.
        #[source]
        source: PollerError,
    },

    /// The service has been shut down.
    #[error("service is shutting down")]
    ShuttingDown,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

type FactoryFn = dyn Fn(&str) -> Arc<dyn WorkerFactory> + Send + Sync;

/// One cache's manager and its one-shot initialisation.
struct CacheSlot {
    manager: Arc<PollerManager>,
    ready: OnceCell<()>,
}

/// Serves per-cache node snapshots. Each cache gets its own
/// [`PollerManager`], created on the first request for it.
pub struct NodeInfoService {
    config: Arc<WatchConfig>,
    directory: Arc<dyn ClusterDirectory>,
    factory: Box<FactoryFn>,
    managers: Mutex<HashMap<String, Arc<CacheSlot>>>,
    closed: AtomicBool,
}

impl NodeInfoService {
    /// Scrapes each node's Prometheus endpoint for the cache's entry count.
    pub fn new(config: Arc<WatchConfig>, directory: Arc<dyn ClusterDirectory>) -> Self {
        let scrape_config = config.clone();
        Self::with_factory(config, directory, move |cache| -> Arc<dyn WorkerFactory> {
            let target = ScrapeTarget {
                metrics_port: scrape_config.metrics_port,
                metrics_path: scrape_config.metrics_path.clone(),
                metric: scrape_config.entries_metric.clone(),
                cache: cache_label(cache).to_string(),
            };
            Arc::new(ScrapeWorkerFactory::new(target, scrape_config.scrape_timeout()))
        })
    }

    /// Like [`new`](NodeInfoService::new) but builds each cache's workers
    /// with `factory` instead of the Prometheus scraper.
    pub fn with_factory<F>(
        config: Arc<WatchConfig>,
        directory: Arc<dyn ClusterDirectory>,
        factory: F,
    ) -> Self
    where
        F: Fn(&str) -> Arc<dyn WorkerFactory> + Send + Sync + 'static,
    {
        Self {
            config,
            directory,
            factory: Box::new(factory),
            managers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the manager for `cache`, initialising it on first use.
    ///
    /// Concurrent first requests for one cache share a single `init`; the
    /// map lock is not held while it runs, so other caches and
    /// [`shutdown`](NodeInfoService::shutdown) never wait on it.
    pub async fn manager_for(&self, cache: &str) -> Result<Arc<PollerManager>, ApiError> {
        let slot = {
            let mut managers = self.managers.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(ApiError::ShuttingDown);
            }
            managers
                .entry(cache.to_string())
                .or_insert_with(|| {
                    let factory = (self.factory)(cache);
                    let manager = PollerManager::builder(self.directory.clone(), factory)
                        .refresh_rate(self.config.refresh_rate())
                        .build();
                    tracing::info!(cache, "created poller manager");
                    Arc::new(CacheSlot {
                        manager: Arc::new(manager),
                        ready: OnceCell::new(),
                    })
                })
                .clone()
        };

        let name = format!("node-info-{}", cache);
        slot.ready
            .get_or_try_init(|| slot.manager.init(&name))
            .await
            .map_err(|source| match source {
                PollerError::Destroyed => ApiError::ShuttingDown,
                source => ApiError::Poller {
                    cache: cache.to_string(),
                    source,
                },
            })?;
        Ok(slot.manager.clone())
    }

    /// Snapshot of every node's latest value for `cache`.
    pub async fn nodes(&self, cache: &str) -> Result<Vec<NodeInfo>, ApiError> {
        Ok(self.manager_for(cache).await?.get_all_values())
    }

    /// Destroys every manager. Later requests fail with
    /// [`ApiError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let mut managers = self.managers.lock().await;
        self.closed.store(true, Ordering::Release);
        for (cache, slot) in managers.drain() {
            tracing::debug!(cache = %cache, "destroying poller manager");
            slot.manager.destroy();
        }
    }

    /// Prometheus text of the latest value of every node of every cache.
    pub async fn render_prometheus(&self) -> String {
        let managers: Vec<(String, Arc<PollerManager>)> = {
            let managers = self.managers.lock().await;
            let mut entries: Vec<_> = managers
                .iter()
                .filter(|(_, slot)| slot.ready.initialized())
                .map(|(cache, slot)| (cache.clone(), slot.manager.clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let mut output = String::new();
        output.push_str("# HELP cachewatch_node_entries Latest entry count reported by a node\n");
        output.push_str("# TYPE cachewatch_node_entries gauge\n");
        for (cache, manager) in &managers {
            for info in manager.get_all_values() {
                if let Some(value) = info.value {
                    let _ = writeln!(
                        output,
                        "cachewatch_node_entries{{cache=\"{}\",node=\"{}\",address=\"{}\"}} {}",
                        escape_label(cache),
                        info.id,
                        escape_label(&info.address.to_string()),
                        value
                    );
                }
            }
        }
        output.push_str("# HELP cachewatch_nodes Nodes currently polled\n");
        output.push_str("# TYPE cachewatch_nodes gauge\n");
        for (cache, manager) in &managers {
            let _ = writeln!(
                output,
                "cachewatch_nodes{{cache=\"{}\"}} {}",
                escape_label(cache),
                manager.node_count()
            );
        }
        output
    }

    /// Routes of the node info API.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/v1/nodes", get(default_nodes_handler))
            .route("/api/v1/nodes/:cache_name", get(nodes_handler))
            .with_state(self)
    }

    /// Serves until `shutdown` resolves, then destroys every manager.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = self.clone().router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Node info API listening on {}", addr);

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;
        self.shutdown().await;
        Ok(())
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<Arc<NodeInfoService>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_prometheus().await,
    )
}

async fn default_nodes_handler(
    State(state): State<Arc<NodeInfoService>>,
) -> Result<Json<Vec<NodeInfo>>, ApiError> {
    let cache = state.config.default_cache.clone();
    Ok(Json(state.nodes(&cache).await?))
}

async fn nodes_handler(
    State(state): State<Arc<NodeInfoService>>,
    Path(cache_name): Path<String>,
) -> Result<Json<Vec<NodeInfo>>, ApiError> {
    Ok(Json(state.nodes(&cache_name).await?))
}
