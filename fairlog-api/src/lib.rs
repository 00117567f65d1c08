pub mod model;
pub mod routes;
pub mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::model::{Predictor, ThresholdModel};
use fairlog_batch::{BatchBuilder, QueryStore, Sequencer, SqliteStore};
use fairlog_core::config::{BatchConfig, FairlogConfig};
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::now_ms;
use fairlog_itmac::provider::Provider;
use fairlog_ledger::Ledger;
use fairlog_verify::keys::KeyStore;
use fairlog_verify::merkle::MerkleTree;

pub struct AppState {
    pub sequencer: Sequencer,
    pub builder: Arc<BatchBuilder>,
    pub provider: Arc<Provider>,
    pub models: HashMap<u32, Arc<dyn Predictor>>,
    pub bundle_timeout: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn QueryStore>,
        provider: Provider,
        models: Vec<Arc<dyn Predictor>>,
        merkle: MerkleTree,
        batch: BatchConfig,
        bundle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sequencer: Sequencer::new(store.clone()),
            builder: Arc::new(BatchBuilder::new(store, merkle, batch)),
            provider: Arc::new(provider),
            models: models.into_iter().map(|m| (m.model_id(), m)).collect(),
            bundle_timeout,
            start_time: Instant::now(),
        })
    }
}

/// The provider process: query log, IT-MAC responder, proof server and the
/// batching sweep against one ledger.
pub struct ApiServer {
    config: FairlogConfig,
    ledger: Arc<dyn Ledger>,
}

impl ApiServer {
    pub fn new(config: FairlogConfig, ledger: Arc<dyn Ledger>) -> Self {
        Self { config, ledger }
    }

    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        let server = &self.config.server;

        let keys = KeyStore::open_at(server.data_dir.join("keys"))?.provider_keys()?;
        let provider = Provider::new(keys);
        let store = Arc::new(SqliteStore::open(&server.data_dir.join("queries.db"))?);

        let model: Arc<dyn Predictor> = match &server.model_path {
            Some(path) => Arc::new(ThresholdModel::from_file(path)?),
            None => {
                tracing::warn!("no model configured, serving the built-in demo model");
                Arc::new(ThresholdModel::demo())
            }
        };

        eprintln!("provider key: {}", provider.public_key_hex());
        eprintln!(
            "model {} loaded ({} features)",
            model.model_id(),
            model.input_len()
        );

        let merkle = MerkleTree::from_config(&self.config.merkle)?;
        tracing::info!(digest = merkle.digester().name(), "merkle leaf hash");

        let state = AppState::new(
            store,
            provider,
            vec![model],
            merkle,
            self.config.batch.clone(),
            Duration::from_millis(server.bundle_timeout_ms),
        );

        let sweeper = spawn_sweeper(
            state.builder.clone(),
            self.ledger.clone(),
            Duration::from_millis(self.config.batch.sweep_interval_ms),
        );

        let app = build_router(state);

        let addr: SocketAddr = server
            .bind
            .parse()
            .map_err(|e| FairlogError::Config(format!("invalid bind addr: {e}")))?;

        let listener = TcpListener::bind(addr).await?;

        eprintln!("listening on {addr}");
        eprintln!("  predict:  POST http://{addr}/predict");
        eprintln!("  proofs:   GET  http://{addr}/proof/{{seq}}?model_id={{id}}");
        eprintln!("  health:   GET  http://{addr}/health");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await;

        sweeper.abort();
        served?;
        Ok(())
    }
}

/// Run `BatchBuilder::sweep` on a fixed interval until the task is aborted.
pub fn spawn_sweeper(
    builder: Arc<BatchBuilder>,
    ledger: Arc<dyn Ledger>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match builder.sweep(ledger.as_ref(), now_ms()).await {
                Ok(report) => {
                    for batch in &report.created {
                        tracing::info!(
                            batch_id = %batch.id,
                            model_id = batch.model_id,
                            start = batch.start_seq,
                            end = batch.end_seq,
                            "batch created"
                        );
                    }
                    for model_id in &report.failed_models {
                        tracing::error!(model_id, "batching blocked by an integrity error");
                    }
                }
                Err(e) => tracing::error!(error = %e, "sweep failed"),
            }
        }
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    use routes::{log, predict};

    Router::new()
        .route("/predict", post(predict::predict))
        .route("/proof/{seq_num}", get(log::proof))
        .route("/batches", get(log::batches))
        .route("/health", get(log::health))
        .with_state(state)
}
