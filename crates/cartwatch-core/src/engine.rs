//! Engine orchestration: broker intake, partitioned workers, shutdown.
//!
//! # Architecture
//!
//! ```text
//! Broker ──► intake task ──► PartitionRouter ──┬──► worker 0 (ShardStore)
//!            (validate,                        ├──► worker 1 (ShardStore)
//!             rate-limit)                      └──► worker N (ShardStore)
//!                                                      │
//!                                     finalize ──► Classifier ──► Sink (retry)
//!                                                      │              │
//!                                                  SummaryCache   DeadLetterQueue
//! ```
//!
//! One worker task per partition owns its `ShardStore` exclusively, so event
//! application and the timeout sweep for a session never race. Deliveries
//! are acked only after their effect is applied (or the event is
//! deliberately dropped); combined with the dedupe window this gives
//! exactly-once effects over at-least-once delivery.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::cache::SummaryCache;
use crate::classifier::Classifier;
use crate::config::EngineConfig;
use crate::error::{BrokerError, Error, Result, SinkError};
use crate::event::Event;
use crate::metrics::{EngineMetrics, HealthReport, HealthStatus};
use crate::retry::{with_retry, RetryPolicy};
use crate::router::PartitionRouter;
use crate::session::{Phase, SessionState};
use crate::sink::{DeadLetterQueue, SessionSink};
use crate::store::{ShardOutcome, ShardStore};
use crate::summary::SessionSummary;
use crate::token_bucket::TokenBucket;

/// Idle backoff when the broker has nothing for us.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(20);

/// Backoff between broker reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Millisecond wall clock, injectable so tests control time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX)
    }
}

/// Hand-cranked clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::atomic::AtomicU64);

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(now_ms))
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct WorkerItem {
    partition: usize,
    offset: u64,
    event: Event,
}

/// The session-aggregation engine.
///
/// Construct with [`Engine::new`], then [`Engine::start`] to spawn the
/// intake and worker tasks. The returned [`EngineHandle`] exposes health
/// and lookup while running and performs the drain-and-flush shutdown.
pub struct Engine {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn SessionSink>,
    classifier: Arc<dyn Classifier>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Validate the configuration and assemble an engine.
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn SessionSink>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            broker,
            sink,
            classifier,
            clock: Arc::new(SystemClock),
        })
    }

    /// Substitute the wall clock, for deterministic tests.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the intake task and one worker task per partition.
    pub fn start(self) -> Result<EngineHandle> {
        let router = PartitionRouter::new(self.config.workers)?;
        let metrics = Arc::new(EngineMetrics::new());
        let cache = Arc::new(Mutex::new(SummaryCache::new()));
        let dlq = Arc::new(DeadLetterQueue::new(self.config.dead_letter_capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker_down = Arc::new(AtomicBool::new(false));

        let mut senders = Vec::with_capacity(self.config.workers);
        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let (tx, rx) = mpsc::channel::<WorkerItem>(self.config.worker_queue_depth);
            senders.push(tx);
            let ctx = WorkerCtx {
                worker_id,
                shard: ShardStore::new(self.config.dedupe_window, self.config.finalized_window),
                broker: Arc::clone(&self.broker),
                sink: Arc::clone(&self.sink),
                classifier: Arc::clone(&self.classifier),
                cache: Arc::clone(&cache),
                dlq: Arc::clone(&dlq),
                metrics: Arc::clone(&metrics),
                clock: Arc::clone(&self.clock),
                retry: RetryPolicy::from_config(&self.config.retry),
                timeout_ms: self.config.session_timeout_secs * 1000,
                checkout_grace_ms: self.config.checkout_grace_secs * 1000,
                cache_ttl_ms: self.config.cache_ttl().as_millis() as u64,
                resident: 0,
            };
            workers.push(spawn_worker_task(
                ctx,
                rx,
                self.config.sweep_interval(),
            ));
        }

        let intake = spawn_intake_task(
            self.config.clone(),
            Arc::clone(&self.broker),
            router,
            senders,
            Arc::clone(&metrics),
            Arc::clone(&self.clock),
            shutdown_rx,
            Arc::clone(&broker_down),
        );

        info!(
            workers = self.config.workers,
            session_timeout_secs = self.config.session_timeout_secs,
            "engine started"
        );

        Ok(EngineHandle {
            intake,
            workers,
            shutdown_tx,
            metrics,
            cache,
            dlq,
            sink: self.sink,
            broker: self.broker,
            broker_down,
            clock: self.clock,
            cache_ttl_ms: self.config.cache_ttl().as_millis() as u64,
        })
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    intake: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<EngineMetrics>,
    cache: Arc<Mutex<SummaryCache>>,
    dlq: Arc<DeadLetterQueue>,
    sink: Arc<dyn SessionSink>,
    broker: Arc<dyn Broker>,
    broker_down: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    cache_ttl_ms: u64,
}

impl EngineHandle {
    /// Shared metrics registry.
    #[must_use]
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current health report.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let snapshot = self.metrics.snapshot();
        let dead_letters = self.dlq.len() as u64;
        let status = if self.broker_down.load(Ordering::SeqCst) {
            HealthStatus::Unhealthy
        } else if dead_letters > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            active_sessions: snapshot.active_sessions,
            dead_letters,
            in_flight: self.broker.in_flight() as u64,
            metrics: snapshot,
        }
    }

    /// Fast-read a finalized summary: cache first, durable store on miss.
    /// A durable hit repopulates the cache.
    pub fn lookup(&self, session_id: &str) -> std::result::Result<Option<SessionSummary>, SinkError> {
        let now = self.clock.now_ms();
        {
            let mut cache = lock_cache(&self.cache);
            if let Some(summary) = cache.get(session_id, now) {
                return Ok(Some(summary.clone()));
            }
        }
        match self.sink.fetch(session_id)? {
            Some(summary) => {
                lock_cache(&self.cache).put(summary.clone(), self.cache_ttl_ms, now);
                Ok(Some(summary))
            }
            None => Ok(None),
        }
    }

    /// Dead-letter queue, for redrive tooling.
    #[must_use]
    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        Arc::clone(&self.dlq)
    }

    /// Whether the engine halted because the broker became unavailable.
    #[must_use]
    pub fn is_broker_down(&self) -> bool {
        self.broker_down.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop intake, flush every resident session through
    /// classify-and-persist, then return the final health report.
    pub async fn shutdown(self) -> Result<HealthReport> {
        info!("engine shutdown requested");
        // Ignore send errors: intake may have already exited on broker loss.
        let _ = self.shutdown_tx.send(true);

        match self.intake.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "intake task exited with error"),
            Err(e) => error!(error = %e, "intake task panicked"),
        }
        // Worker channels close when intake drops its senders; each worker
        // drains its shard before exiting.
        for (i, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = i, error = %e, "worker task panicked");
            }
        }

        let report = HealthReport {
            status: if self.broker_down.load(Ordering::SeqCst) {
                HealthStatus::Unhealthy
            } else if self.dlq.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            active_sessions: self.metrics.active_sessions.load(Ordering::Relaxed),
            dead_letters: self.dlq.len() as u64,
            in_flight: self.broker.in_flight() as u64,
            metrics: self.metrics.snapshot(),
        };
        info!(
            finalized = report.metrics.sessions_finalized,
            persisted = report.metrics.summaries_persisted,
            dead_letters = report.dead_letters,
            "engine shutdown complete"
        );
        Ok(report)
    }
}

fn lock_cache(cache: &Mutex<SummaryCache>) -> std::sync::MutexGuard<'_, SummaryCache> {
    cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[allow(clippy::too_many_arguments)]
fn spawn_intake_task(
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    router: PartitionRouter,
    senders: Vec<mpsc::Sender<WorkerItem>>,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    mut shutdown_rx: watch::Receiver<bool>,
    broker_down: Arc<AtomicBool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut bucket = (config.max_events_per_sec > 0)
            .then(|| TokenBucket::per_second(config.max_events_per_sec, clock.now_ms()));
        let reconnects = AtomicU32::new(0);

        loop {
            if *shutdown_rx.borrow() {
                debug!("intake: shutdown signal received");
                return Ok(());
            }

            if let Some(bucket) = bucket.as_mut() {
                let now = clock.now_ms();
                let batch = config.poll_batch_size as u32;
                if !bucket.try_acquire(batch, now) {
                    EngineMetrics::incr(&metrics.rate_limited_polls);
                    let wait = bucket.wait_time_ms(batch, now);
                    tokio::time::sleep(Duration::from_millis(wait.max(1))).await;
                    continue;
                }
            }

            let batch = match broker.poll(config.poll_batch_size) {
                Ok(batch) => {
                    reconnects.store(0, Ordering::Relaxed);
                    batch
                }
                Err(BrokerError::ConnectionLost(reason)) => {
                    let attempt = reconnects.fetch_add(1, Ordering::Relaxed) + 1;
                    EngineMetrics::incr(&metrics.broker_reconnects);
                    warn!(attempt, %reason, "broker connection lost; retrying");
                    if attempt >= config.broker_retry_budget {
                        broker_down.store(true, Ordering::SeqCst);
                        error!(attempts = attempt, "broker unavailable; intake halting");
                        return Err(Error::Broker(BrokerError::Unavailable {
                            attempts: attempt,
                        }));
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                Err(e) => return Err(Error::Broker(e)),
            };

            if batch.is_empty() {
                // Nothing pending; let the shutdown signal interrupt the nap.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_DELAY) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            }

            for delivery in batch {
                EngineMetrics::incr(&metrics.events_consumed);
                dispatch(&broker, &router, &senders, &metrics, delivery).await?;
            }
        }
    })
}

/// Validate, route, and enqueue one delivery. Drops (and acks) events that
/// fail validation or routing.
async fn dispatch(
    broker: &Arc<dyn Broker>,
    router: &PartitionRouter,
    senders: &[mpsc::Sender<WorkerItem>],
    metrics: &EngineMetrics,
    delivery: Delivery,
) -> Result<()> {
    let Delivery {
        partition,
        offset,
        payload,
    } = delivery;

    let event = match Event::from_json(&payload) {
        Ok(event) => event,
        Err(e) => {
            EngineMetrics::incr(&metrics.malformed_events);
            debug!(partition, offset, error = %e, "dropping malformed event");
            ack_dropped(broker, partition, offset);
            return Ok(());
        }
    };

    let worker = match router.route(&event.session_id) {
        Ok(idx) => idx,
        Err(e) => {
            EngineMetrics::incr(&metrics.routing_errors);
            debug!(partition, offset, error = %e, "dropping unroutable event");
            ack_dropped(broker, partition, offset);
            return Ok(());
        }
    };

    senders[worker]
        .send(WorkerItem {
            partition,
            offset,
            event,
        })
        .await
        .map_err(|_| Error::Engine(format!("worker {worker} channel closed")))
}

fn ack_dropped(broker: &Arc<dyn Broker>, partition: usize, offset: u64) {
    if let Err(e) = broker.ack(partition, offset) {
        warn!(partition, offset, error = %e, "ack failed for dropped event");
    }
}

struct WorkerCtx {
    worker_id: usize,
    shard: ShardStore,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn SessionSink>,
    classifier: Arc<dyn Classifier>,
    cache: Arc<Mutex<SummaryCache>>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeout_ms: u64,
    checkout_grace_ms: u64,
    cache_ttl_ms: u64,
    /// Last published resident-session count, for the shared gauge.
    resident: usize,
}

fn spawn_worker_task(
    mut ctx: WorkerCtx,
    mut rx: mpsc::Receiver<WorkerItem>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                item = rx.recv() => {
                    match item {
                        Some(item) => ctx.handle_item(item).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => ctx.run_sweep().await,
            }
        }
        ctx.drain_on_shutdown().await;
    })
}

impl WorkerCtx {
    async fn handle_item(&mut self, item: WorkerItem) {
        let outcome = self.shard.apply_event(&item.event);
        match outcome {
            ShardOutcome::Applied => {}
            ShardOutcome::Duplicate => {
                EngineMetrics::incr(&self.metrics.duplicates);
                debug!(
                    worker = self.worker_id,
                    event_id = %item.event.event_id,
                    "duplicate delivery absorbed"
                );
            }
            ShardOutcome::Anomaly => {
                EngineMetrics::incr(&self.metrics.anomalies);
                debug!(
                    worker = self.worker_id,
                    session_id = %item.event.session_id,
                    event_type = %item.event.event_type,
                    "event invalid for session phase; ignored"
                );
            }
            ShardOutcome::LateForFinalized => {
                EngineMetrics::incr(&self.metrics.late_for_finalized);
                debug!(
                    worker = self.worker_id,
                    session_id = %item.event.session_id,
                    "late event for finalized session; dropped"
                );
            }
            ShardOutcome::Finalized(state) => {
                self.finalize_and_persist(*state).await;
            }
        }
        self.sync_gauge();
        // Ack only after the event's effect is in place.
        if let Err(e) = self.broker.ack(item.partition, item.offset) {
            warn!(
                worker = self.worker_id,
                partition = item.partition,
                offset = item.offset,
                error = %e,
                "ack failed"
            );
        }
    }

    async fn run_sweep(&mut self) {
        let now = self.clock.now_ms();
        let expired = self
            .shard
            .sweep(now, self.timeout_ms, self.checkout_grace_ms);
        if !expired.is_empty() {
            debug!(
                worker = self.worker_id,
                count = expired.len(),
                "sweep finalized inactive sessions"
            );
        }
        for state in expired {
            self.finalize_and_persist(state).await;
        }
        self.sync_gauge();
    }

    async fn drain_on_shutdown(&mut self) {
        let resident = self.shard.drain();
        if !resident.is_empty() {
            info!(
                worker = self.worker_id,
                count = resident.len(),
                "flushing resident sessions on shutdown"
            );
        }
        for state in resident {
            self.finalize_and_persist(state).await;
        }
        self.sync_gauge();
    }

    async fn finalize_and_persist(&self, state: SessionState) {
        let now = self.clock.now_ms();
        EngineMetrics::incr(&self.metrics.sessions_finalized);
        let verdict = match state.phase {
            Phase::Purchased => {
                EngineMetrics::incr(&self.metrics.sessions_purchased);
                None
            }
            Phase::Abandoned => {
                EngineMetrics::incr(&self.metrics.sessions_abandoned);
                Some(self.classifier.classify(&state, now))
            }
            _ => {
                EngineMetrics::incr(&self.metrics.sessions_browsing_closed);
                None
            }
        };

        let summary = SessionSummary::build(&state, verdict.as_ref(), now);
        let result = with_retry(&self.retry, || {
            let summary = &summary;
            async move { self.sink.persist(summary) }
        })
        .await;

        match result {
            Ok(()) => {
                EngineMetrics::incr(&self.metrics.summaries_persisted);
                lock_cache(&self.cache).put(summary, self.cache_ttl_ms, now);
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.dead_letters);
                warn!(
                    worker = self.worker_id,
                    session_id = %summary.session_id,
                    error = %e,
                    "summary write failed; dead-lettering"
                );
                self.dlq.push(summary);
            }
        }
    }

    fn sync_gauge(&mut self) {
        let len = self.shard.len();
        if len > self.resident {
            self.metrics
                .active_sessions
                .fetch_add((len - self.resident) as u64, Ordering::Relaxed);
        } else {
            self.metrics
                .active_sessions
                .fetch_sub((self.resident - len) as u64, Ordering::Relaxed);
        }
        self.resident = len;
    }
}
