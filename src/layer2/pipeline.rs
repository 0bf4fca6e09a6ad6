// Ingestion Pipeline - connection -> normalizer -> metric engine -> mailbox
// One dedicated ingestion thread with its own current-thread runtime

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::config::{ConfigError, PipelineConfig};
use crate::core::events::{Event, EventBus, EventKind};
use crate::core::types::{ConnectionState, FeeTier, LatencySample, PipelineOutput};
use crate::layer1::connection::{
    ConnectionConfig, ConnectionStateHandle, ConnectionStats, FrameTransport, StreamConnection,
    StreamError, Subscription,
};
use crate::layer1::websocket::WsTransport;
use crate::layer2::latency::LatencyTracker;
use crate::layer2::mailbox::Mailbox;
use crate::layer2::metric_engine::{EngineStats, MetricEngine, MetricEngineConfig};
use crate::layer2::metrics::PipelineStats;
use crate::layer2::normalizer::{NormalizerStats, OrderbookNormalizer};

const SOURCE: &str = "pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("ingestion thread exited before reporting startup")]
    WorkerExited,
}

/// Counters the ingestion thread shares with observers
#[derive(Debug, Clone, Default)]
struct WorkerStats {
    frames_processed: u64,
    published: u64,
    validation_failures: u64,
    stale_dropped: u64,
    normalizer: NormalizerStats,
    engine: EngineStats,
    latency: Option<LatencySample>,
}

// ============================================================================
// Ingestion Pipeline
// ============================================================================

/// Owns the ingestion thread. Consumers read results from `mailbox()` only.
pub struct IngestionPipeline {
    config: PipelineConfig,
    mailbox: Arc<Mailbox<PipelineOutput>>,
    events: Arc<EventBus>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    connection: ConnectionStateHandle,
    stats: Arc<RwLock<WorkerStats>>,
    fatal: Arc<RwLock<Option<StreamError>>>,
    running: Arc<AtomicBool>,
    started_at: Instant,
}

impl IngestionPipeline {
    /// Connect to `config.endpoint` over WebSocket. Returns once the stream is
    /// Subscribed, or with the error that prevented it.
    pub fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::start_with_transport(config, WsTransport::new(), Arc::new(EventBus::new()))
    }

    pub fn start_with_transport<T>(
        config: PipelineConfig,
        transport: T,
        events: Arc<EventBus>,
    ) -> Result<Self, PipelineError>
    where
        T: FrameTransport + 'static,
    {
        config.validate()?;
        info!(endpoint = %config.endpoint, symbol = %config.symbol, order_size = config.order_size, "Starting ingestion pipeline");

        let connection = StreamConnection::new(
            transport,
            &config.endpoint,
            Subscription::from_config(&config),
            ConnectionConfig::from_config(&config),
            Arc::clone(&events),
        );
        let connection_handle = connection.state_handle();

        let mailbox = Arc::new(Mailbox::new());
        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        let fatal = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = sync_channel::<Result<(), PipelineError>>(1);

        let worker = Worker {
            normalizer: OrderbookNormalizer::new(&config.symbol),
            engine: MetricEngine::new(MetricEngineConfig::from_config(&config), Arc::clone(&events)),
            latency: LatencyTracker::new(),
            connection,
            mailbox: Arc::clone(&mailbox),
            events: Arc::clone(&events),
            stats: Arc::clone(&stats),
            fatal: Arc::clone(&fatal),
            running: Arc::clone(&running),
            order_size: config.order_size,
            fee_tier: config.fee_tier,
            stats_log_interval: config.stats_log_interval,
        };

        let handle = std::thread::Builder::new()
            .name(format!("ingestion-{}", config.symbol))
            .spawn(move || worker.run(shutdown_rx, ready_tx))
            .map_err(|e| PipelineError::Runtime(e.to_string()))?;

        let startup = ready_rx.recv().unwrap_or(Err(PipelineError::WorkerExited));
        if let Err(e) = startup {
            if handle.join().is_err() {
                warn!("Ingestion thread panicked during startup");
            }
            return Err(e);
        }

        info!(symbol = %config.symbol, "Ingestion pipeline started");
        Ok(Self {
            config,
            mailbox,
            events,
            shutdown_tx,
            worker: Some(handle),
            connection: connection_handle,
            stats,
            fatal,
            running,
            started_at: Instant::now(),
        })
    }

    /// Signal shutdown and wait for the ingestion thread. Nothing is published
    /// after this returns. Idempotent.
    pub fn stop(&mut self) {
        let handle = match self.worker.take() {
            Some(handle) => handle,
            None => return,
        };
        debug!("Stopping pipeline");

        // Receiver may already be gone if the worker exited on a fatal error
        let _ = self.shutdown_tx.send(true);

        debug!("Waiting for ingestion thread to finish...");
        if let Err(e) = handle.join() {
            warn!("Ingestion thread panicked: {:?}", e);
        }
        self.mailbox.close();
        self.running.store(false, Ordering::SeqCst);

        info!("Pipeline stopped");
    }

    pub fn mailbox(&self) -> Arc<Mailbox<PipelineOutput>> {
        Arc::clone(&self.mailbox)
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connection.stats()
    }

    /// False once the ingestion thread has exited, for any reason
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The error that terminated ingestion after startup, if any
    pub fn fatal_error(&self) -> Option<StreamError> {
        self.fatal.read().clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let worker = self.stats.read().clone();
        PipelineStats {
            connection: self.connection.stats(),
            frames_processed: worker.frames_processed,
            published: worker.published,
            validation_failures: worker.validation_failures,
            stale_dropped: worker.stale_dropped,
            normalizer: worker.normalizer,
            engine: worker.engine,
            latency: worker.latency,
            mailbox: self.mailbox.stats(),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Drop for IngestionPipeline {
    fn drop(&mut self) {
        self.stop();
        debug!("IngestionPipeline dropped");
    }
}

// ============================================================================
// Ingestion Worker
// ============================================================================

struct Worker<T: FrameTransport> {
    connection: StreamConnection<T>,
    normalizer: OrderbookNormalizer,
    engine: MetricEngine,
    latency: LatencyTracker,
    mailbox: Arc<Mailbox<PipelineOutput>>,
    events: Arc<EventBus>,
    stats: Arc<RwLock<WorkerStats>>,
    fatal: Arc<RwLock<Option<StreamError>>>,
    running: Arc<AtomicBool>,
    order_size: f64,
    fee_tier: FeeTier,
    stats_log_interval: u64,
}

impl<T: FrameTransport> Worker<T> {
    fn run(self, shutdown: watch::Receiver<bool>, ready: SyncSender<Result<(), PipelineError>>) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.mailbox.close();
                let _ = ready.send(Err(PipelineError::Runtime(e.to_string())));
                return;
            }
        };
        runtime.block_on(self.drive(shutdown, ready));
    }

    async fn drive(mut self, mut shutdown: watch::Receiver<bool>, ready: SyncSender<Result<(), PipelineError>>) {
        if let Err(e) = self.connection.open(&mut shutdown).await {
            self.mailbox.close();
            let _ = ready.send(Err(e.into()));
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let _ = ready.send(Ok(()));
        self.events.publish(
            Event::new(EventKind::PipelineStarted, SOURCE).with("session", self.connection.session()),
        );

        self.process(&mut shutdown).await;

        self.connection.close().await;
        self.mailbox.close();
        self.running.store(false, Ordering::SeqCst);

        let published = self.stats.read().published;
        info!(published = published, "Ingestion loop exited");
        self.events.publish(Event::new(EventKind::PipelineStopped, SOURCE).with("published", published));
    }

    async fn process(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let mut session = 0u64;
        // Highest sequence id published; survives resubscribes
        let mut watermark: Option<u64> = None;

        loop {
            let frame = match self.connection.read_next(shutdown).await {
                Ok(frame) => frame,
                Err(StreamError::Closed) => break,
                Err(e) => {
                    *self.fatal.write() = Some(e);
                    break;
                }
            };

            if frame.session != session {
                if session != 0 {
                    debug!(from = session, to = frame.session, "New session, resetting book");
                }
                self.normalizer.reset();
                session = frame.session;
            }

            let token = self.latency.begin(frame.received_at, frame.venue_transit_ms());
            self.stats.write().frames_processed += 1;

            let snapshot = match self.normalizer.normalize(&frame) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.stats.write().validation_failures += 1;
                    self.events.publish(
                        Event::new(EventKind::ValidationFailed, SOURCE)
                            .with("seq", frame.sequence_id)
                            .with("error", e.to_string()),
                    );
                    continue;
                }
            };

            if let Some(last) = watermark {
                if snapshot.sequence_id < last {
                    self.stats.write().stale_dropped += 1;
                    self.events.publish(
                        Event::new(EventKind::StaleFrameDropped, SOURCE)
                            .with("seq", snapshot.sequence_id)
                            .with("watermark", last),
                    );
                    continue;
                }
            }

            let metrics = self.engine.compute(&snapshot, self.order_size, self.fee_tier);
            let latency = self.latency.end(token);

            if *shutdown.borrow() {
                break;
            }

            let sequence_id = snapshot.sequence_id;
            let output = PipelineOutput { snapshot, metrics, latency, session };
            if !self.mailbox.publish(output) {
                break;
            }
            watermark = Some(sequence_id);

            let published = {
                let mut stats = self.stats.write();
                stats.published += 1;
                stats.normalizer = self.normalizer.stats();
                stats.engine = self.engine.stats();
                stats.latency = Some(latency);
                stats.published
            };

            if self.stats_log_interval > 0 && published % self.stats_log_interval == 0 {
                info!(
                    published = published,
                    avg_ms = latency.running_average_ms,
                    min_ms = latency.min_ms,
                    max_ms = latency.max_ms,
                    last_total_ms = latency.total_ms,
                    "Performance"
                );
            }
        }

        let mut stats = self.stats.write();
        stats.normalizer = self.normalizer.stats();
        stats.engine = self.engine.stats();
    }
}
