//! Asynchronous anchoring queue.
//!
//! Decouples payment completion from the slow, rate-limited ledger write.
//! A fixed pool of workers drains a shared channel; a token bucket caps job
//! starts per time window independently of pool size; failed jobs retry
//! with exponential backoff until the attempt budget is spent, then land in
//! a queryable dead-letter list.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AnchorConfig, RateLimitConfig, RetryConfig};
use crate::error::{AnchorError, Result};

use super::orchestrator::AnchorOrchestrator;

#[derive(Debug, Clone)]
struct AnchorJob {
    id: Uuid,
    payment_id: Uuid,
    attempt: u32,
}

impl AnchorJob {
    fn fresh(payment_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            payment_id,
            attempt: 1,
        }
    }
}

/// Observable resolution of a job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { error: String, delay: Duration },
    DeadLettered { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub payment_id: Uuid,
    pub attempt: u32,
    pub outcome: JobOutcome,
}

/// Terminal record of a job that exhausted its retry budget. Kept for
/// inspection and manual recovery, never silently discarded.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub payment_id: Uuid,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Single-flight registry state for one payment id.
enum FlightState {
    InFlight,
    /// Enqueued again while in flight; one re-run is dispatched after the
    /// current attempt resolves.
    Deferred,
}

/// Token bucket gating job starts, adapted for a single shared key.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.max_starts.max(1));
        let refill_rate = capacity / config.window().as_secs_f64().max(0.001);
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    /// `None` if a token was consumed, otherwise the wait until one refills.
    fn try_acquire(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = f64::min(self.capacity, self.tokens + elapsed * self.refill_rate);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }
}

struct QueueInner {
    tx: Mutex<Option<mpsc::Sender<AnchorJob>>>,
    flights: Mutex<HashMap<Uuid, FlightState>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    events: broadcast::Sender<JobEvent>,
    limiter: Mutex<TokenBucket>,
    retry: RetryConfig,
    /// Admitted flights not yet resolved (including backoff waits).
    active: AtomicUsize,
    idle: Notify,
}

impl QueueInner {
    async fn send(&self, job: AnchorJob) -> bool {
        let sender = self.tx.lock().await.clone();
        match sender {
            Some(tx) => tx.send(job).await.is_ok(),
            None => false,
        }
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine; events are best-effort observability.
        let _ = self.events.send(event);
    }

    async fn acquire_start_slot(&self) {
        loop {
            let wait = self.limiter.lock().await.try_acquire();
            match wait {
                None => return,
                Some(delay) => sleep(delay).await,
            }
        }
    }

    /// Resolves one flight: dispatches the deferred re-run if an enqueue
    /// arrived mid-flight, otherwise releases the slot.
    async fn resolve_flight(&self, payment_id: Uuid) {
        let deferred = {
            let mut flights = self.flights.lock().await;
            match flights.remove(&payment_id) {
                Some(FlightState::Deferred) => {
                    flights.insert(payment_id, FlightState::InFlight);
                    true
                }
                _ => false,
            }
        };

        if deferred {
            if self.send(AnchorJob::fresh(payment_id)).await {
                return;
            }
            // Channel closed during shutdown; drop the deferred run.
            self.flights.lock().await.remove(&payment_id);
        }

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded worker pool feeding payment ids to the orchestrator.
pub struct AnchorQueue {
    inner: Arc<QueueInner>,
    orchestrator: Arc<AnchorOrchestrator>,
    workers: Vec<JoinHandle<()>>,
}

impl AnchorQueue {
    /// Spawns the worker pool. The queue owns its workers; there is no
    /// module-level processor registration.
    pub fn start(orchestrator: Arc<AnchorOrchestrator>, config: &AnchorConfig) -> Self {
        let (tx, rx) = mpsc::channel::<AnchorJob>(1024);
        let (events, _) = broadcast::channel(256);

        let inner = Arc::new(QueueInner {
            tx: Mutex::new(Some(tx)),
            flights: Mutex::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
            events,
            limiter: Mutex::new(TokenBucket::new(&config.rate)),
            retry: config.retry.clone(),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&inner),
                    Arc::clone(&orchestrator),
                ))
            })
            .collect();

        Self {
            inner,
            orchestrator,
            workers,
        }
    }

    /// Admits one anchoring job for the payment. Fire-and-forget: never
    /// blocks on ledger latency. An enqueue for a payment already in flight
    /// coalesces into a single deferred re-run.
    pub async fn enqueue(&self, payment_id: Uuid) -> Result<()> {
        {
            let mut flights = self.inner.flights.lock().await;
            if let Some(state) = flights.get_mut(&payment_id) {
                *state = FlightState::Deferred;
                info!(%payment_id, "anchor attempt already in flight, coalescing");
                return Ok(());
            }
            flights.insert(payment_id, FlightState::InFlight);
        }

        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let job = AnchorJob::fresh(payment_id);
        info!(%payment_id, job_id = %job.id, "payment enqueued for anchoring");

        if !self.inner.send(job).await {
            self.inner.flights.lock().await.remove(&payment_id);
            if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.inner.idle.notify_waiters();
            }
            return Err(AnchorError::Queue("channel closed".to_string()));
        }
        Ok(())
    }

    /// Re-enqueues payments whose anchor record sat in `PENDING` beyond the
    /// staleness threshold. Returns how many were re-admitted.
    pub async fn recover_stale(&self) -> Result<usize> {
        let payment_ids = self.orchestrator.stale_pending().await?;
        let count = payment_ids.len();
        for payment_id in payment_ids {
            warn!(%payment_id, "re-enqueueing stale pending anchor");
            self.enqueue(payment_id).await?;
        }
        Ok(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.read().await.clone()
    }

    /// Waits until no job is queued, running, or waiting out a backoff.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drains, closes the channel, and joins the workers. In-flight jobs
    /// finish; nothing is abandoned mid-attempt.
    pub async fn shutdown(self) {
        self.drain().await;
        self.inner.tx.lock().await.take();
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "anchor worker panicked");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<AnchorJob>>>,
    inner: Arc<QueueInner>,
    orchestrator: Arc<AnchorOrchestrator>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };

        inner.acquire_start_slot().await;
        info!(
            worker,
            job_id = %job.id,
            payment_id = %job.payment_id,
            attempt = job.attempt,
            "processing anchor job"
        );

        match orchestrator.anchor_payment(job.payment_id).await {
            Ok(outcome) => {
                info!(job_id = %job.id, payment_id = %job.payment_id, ?outcome, "anchor job completed");
                inner.publish(JobEvent {
                    job_id: job.id,
                    payment_id: job.payment_id,
                    attempt: job.attempt,
                    outcome: JobOutcome::Completed,
                });
                inner.resolve_flight(job.payment_id).await;
            }
            Err(err) if err.is_retryable() && job.attempt < inner.retry.max_attempts => {
                let delay = inner.retry.delay_for(job.attempt);
                warn!(
                    job_id = %job.id,
                    payment_id = %job.payment_id,
                    attempt = job.attempt,
                    error = %err,
                    ?delay,
                    "anchor job failed, scheduling retry"
                );
                inner.publish(JobEvent {
                    job_id: job.id,
                    payment_id: job.payment_id,
                    attempt: job.attempt,
                    outcome: JobOutcome::Retrying {
                        error: err.to_string(),
                        delay,
                    },
                });

                let inner = Arc::clone(&inner);
                let next = AnchorJob {
                    id: job.id,
                    payment_id: job.payment_id,
                    attempt: job.attempt + 1,
                };
                tokio::spawn(async move {
                    sleep(delay).await;
                    let payment_id = next.payment_id;
                    if !inner.send(next).await {
                        warn!(%payment_id, "queue closed before retry could run");
                        inner.resolve_flight(payment_id).await;
                    }
                });
            }
            Err(err) => {
                error!(
                    job_id = %job.id,
                    payment_id = %job.payment_id,
                    attempt = job.attempt,
                    error = %err,
                    "anchor job dead-lettered"
                );
                inner.dead_letters.write().await.push(DeadLetter {
                    job_id: job.id,
                    payment_id: job.payment_id,
                    attempts: job.attempt,
                    error: err.to_string(),
                    failed_at: Utc::now(),
                });
                inner.publish(JobEvent {
                    job_id: job.id,
                    payment_id: job.payment_id,
                    attempt: job.attempt,
                    outcome: JobOutcome::DeadLettered {
                        error: err.to_string(),
                    },
                });
                inner.resolve_flight(job.payment_id).await;
            }
        }
    }
}
