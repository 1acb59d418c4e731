//! Admission control for one execution processor.
//!
//! Enforces the tier's concurrency ceiling, burst allowance and cooldown,
//! and keeps a bounded, priority-ordered wait queue. Queued requests are
//! dispatched as slots free up, highest priority first and FIFO within a
//! priority.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::dispatch::TaskDispatcher;
use crate::id::correlation_id;
use crate::scheduler::tier::ConcurrencyTier;
use crate::store::{CaptureJob, JobType, PriorityClass, Processor};

/// Recent execution durations kept for wait estimates.
pub const EXECUTION_SAMPLE_WINDOW: usize = 100;

/// Dispatch attempts per request before it is abandoned.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 3;

/// Fraction of `max_concurrent` above which the cooldown arms.
const COOLDOWN_THRESHOLD: f64 = 0.8;

/// Wait estimate used before any execution has been observed.
const DEFAULT_EXECUTION_ESTIMATE: Duration = Duration::from_secs(30);

const DEFAULT_REDISPATCH_DELAY: Duration = Duration::from_millis(250);

/// A request for a processor slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionRequest {
    pub job_id: String,
    pub job_type: JobType,
    pub priority: PriorityClass,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

impl AdmissionRequest {
    /// Build the request that dispatches `job`.
    pub fn for_job(job: &CaptureJob) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            priority: job.priority,
            payload: job.dispatch_payload(),
            correlation_id: correlation_id(&job.id, job.retry_count),
        }
    }
}

/// Result of `acquire`.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// A slot was taken; the caller dispatches and later releases
    Acquired,
    /// Waiting in the queue at a 1-based position
    Queued { position: usize, estimated_wait: Duration },
    /// Queue full; counted as throttled
    Rejected,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }
}

/// Result of handing a request to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched {
        job_id: String,
        correlation_id: String,
        external_id: String,
    },
    /// Every attempt failed; the slot has been given back
    Abandoned { job_id: String, error: String },
}

/// Limiter health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time limiter counters.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterMetrics {
    pub processor: Processor,
    pub current_concurrent: usize,
    pub peak_concurrent: usize,
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub queue_length: usize,
    pub queue_capacity: usize,
    pub average_execution: Duration,
    pub in_cooldown: bool,
}

impl LimiterMetrics {
    pub fn throttle_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.throttled_requests as f64 / self.total_requests as f64
    }

    pub fn queue_utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queue_length as f64 / self.queue_capacity as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: LimiterMetrics,
}

#[derive(Debug)]
struct QueuedRequest {
    request: AdmissionRequest,
    attempts: u32,
}

#[derive(Debug, Default)]
struct LimiterState {
    current: usize,
    peak: usize,
    total_requests: u64,
    throttled: u64,
    durations: VecDeque<Duration>,
    queue: VecDeque<QueuedRequest>,
    cooldown_until: Option<Instant>,
}

impl LimiterState {
    fn admissible(&mut self, tier: &ConcurrencyTier, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }

        if self.current < tier.max_concurrent {
            return true;
        }
        // Bounded overflow
        self.current < tier.burst_capacity
    }

    fn admit(&mut self, tier: &ConcurrencyTier, now: Instant) {
        let threshold = tier.max_concurrent as f64 * COOLDOWN_THRESHOLD;
        let before = self.current;
        self.current += 1;
        self.peak = self.peak.max(self.current);

        let crossed = (before as f64) <= threshold && (self.current as f64) > threshold;
        if crossed && !tier.cooldown.is_zero() {
            self.cooldown_until = Some(now + tier.cooldown);
        }
    }

    /// Insert behind every entry of the same or higher priority.
    fn enqueue(&mut self, entry: QueuedRequest) -> usize {
        let index = self
            .queue
            .iter()
            .position(|queued| queued.request.priority < entry.request.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(index, entry);
        index + 1
    }

    fn record_duration(&mut self, duration: Duration) {
        if self.durations.len() == EXECUTION_SAMPLE_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }

    fn average_execution(&self) -> Duration {
        if self.durations.is_empty() {
            return DEFAULT_EXECUTION_ESTIMATE;
        }
        let total: Duration = self.durations.iter().sum();
        total / self.durations.len() as u32
    }
}

/// Concurrency limiter for one processor.
pub struct ConcurrencyLimiter {
    processor: Processor,
    tier: ConcurrencyTier,
    dispatcher: Arc<dyn TaskDispatcher>,
    redispatch_delay: Duration,
    state: Mutex<LimiterState>,
}

impl ConcurrencyLimiter {
    pub fn new(processor: Processor, tier: ConcurrencyTier, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        log::info!(
            "Limiter for {} initialized: tier={}, max={}, burst={}, queue={}",
            processor,
            tier.name,
            tier.max_concurrent,
            tier.burst_capacity,
            tier.queue_capacity
        );
        Self {
            processor,
            tier,
            dispatcher,
            redispatch_delay: DEFAULT_REDISPATCH_DELAY,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Base delay between dispatch attempts; doubles per attempt.
    pub fn with_redispatch_delay(mut self, delay: Duration) -> Self {
        self.redispatch_delay = delay;
        self
    }

    pub fn processor(&self) -> Processor {
        self.processor
    }

    pub fn tier(&self) -> &ConcurrencyTier {
        &self.tier
    }

    /// Whether a request arriving now would be admitted without queueing.
    pub async fn can_process_immediately(&self) -> bool {
        let mut state = self.state.lock().await;
        state.admissible(&self.tier, Instant::now())
    }

    /// Try to take a slot, queueing the request when none is free.
    pub async fn acquire(&self, request: AdmissionRequest) -> AcquireOutcome {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.total_requests += 1;

        if state.admissible(&self.tier, now) {
            state.admit(&self.tier, now);
            tracing::debug!(
                processor = %self.processor,
                job_id = %request.job_id,
                current = state.current,
                "Slot acquired"
            );
            return AcquireOutcome::Acquired;
        }

        if state.queue.len() < self.tier.queue_capacity {
            let job_id = request.job_id.clone();
            let position = state.enqueue(QueuedRequest { request, attempts: 0 });
            let rounds = position.div_ceil(self.tier.max_concurrent) as u32;
            let estimated_wait = state.average_execution() * rounds;
            tracing::debug!(
                processor = %self.processor,
                job_id = %job_id,
                position,
                "Request queued"
            );
            return AcquireOutcome::Queued {
                position,
                estimated_wait,
            };
        }

        state.throttled += 1;
        tracing::warn!(
            processor = %self.processor,
            job_id = %request.job_id,
            queue_capacity = self.tier.queue_capacity,
            "Queue full, request rejected"
        );
        AcquireOutcome::Rejected
    }

    /// Queue a request without trying for a slot.
    ///
    /// Used while dispatching is held back; returns `Queued` or `Rejected`.
    pub async fn enqueue(&self, request: AdmissionRequest) -> AcquireOutcome {
        let mut state = self.state.lock().await;
        state.total_requests += 1;

        if state.queue.len() >= self.tier.queue_capacity {
            state.throttled += 1;
            tracing::warn!(
                processor = %self.processor,
                job_id = %request.job_id,
                "Queue full, deferred request rejected"
            );
            return AcquireOutcome::Rejected;
        }

        let position = state.enqueue(QueuedRequest { request, attempts: 0 });
        let rounds = position.div_ceil(self.tier.max_concurrent) as u32;
        AcquireOutcome::Queued {
            position,
            estimated_wait: state.average_execution() * rounds,
        }
    }

    /// Dispatch a request that already holds a slot.
    ///
    /// Retries with backoff; after the last failed attempt the slot is given
    /// back and the request is reported abandoned.
    pub async fn dispatch(&self, request: AdmissionRequest) -> DispatchOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .dispatcher
                .submit(request.job_type, request.payload.clone(), &request.correlation_id)
                .await
            {
                Ok(external_id) => {
                    return DispatchOutcome::Dispatched {
                        job_id: request.job_id,
                        correlation_id: request.correlation_id,
                        external_id,
                    };
                }
                Err(e) if attempt < MAX_DISPATCH_ATTEMPTS => {
                    tracing::warn!(
                        processor = %self.processor,
                        job_id = %request.job_id,
                        attempt,
                        error = %e,
                        "Dispatch failed, retrying"
                    );
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => {
                    self.give_back_slot().await;
                    tracing::error!(
                        processor = %self.processor,
                        job_id = %request.job_id,
                        error = %e,
                        "Dispatch abandoned"
                    );
                    return DispatchOutcome::Abandoned {
                        job_id: request.job_id,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    /// Free a slot after a job finished, then dispatch the next waiting request.
    pub async fn release(&self, execution_time: Duration) -> Option<DispatchOutcome> {
        self.free_slot(execution_time).await;
        self.dispatch_next().await
    }

    /// Free a slot and record the execution time, without dispatching.
    pub async fn free_slot(&self, execution_time: Duration) {
        let mut state = self.state.lock().await;
        state.current = state.current.saturating_sub(1);
        state.record_duration(execution_time);
    }

    /// Dispatch waiting requests until the queue is empty or admission stops.
    pub async fn drain(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.dispatch_next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Dispatch the head of the queue if admission allows.
    ///
    /// A failed attempt returns the slot and requeues the request: high and
    /// critical requests at the front, others at the back. A request is
    /// dropped after `MAX_DISPATCH_ATTEMPTS`.
    pub async fn dispatch_next(&self) -> Option<DispatchOutcome> {
        loop {
            let mut entry = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if state.queue.is_empty() || !state.admissible(&self.tier, now) {
                    return None;
                }
                let entry = state.queue.pop_front()?;
                state.admit(&self.tier, now);
                entry
            };

            entry.attempts += 1;
            let request = &entry.request;
            match self
                .dispatcher
                .submit(request.job_type, request.payload.clone(), &request.correlation_id)
                .await
            {
                Ok(external_id) => {
                    tracing::debug!(
                        processor = %self.processor,
                        job_id = %request.job_id,
                        "Queued request dispatched"
                    );
                    return Some(DispatchOutcome::Dispatched {
                        job_id: entry.request.job_id,
                        correlation_id: entry.request.correlation_id,
                        external_id,
                    });
                }
                Err(e) => {
                    let attempts = entry.attempts;
                    let mut state = self.state.lock().await;
                    state.current = state.current.saturating_sub(1);

                    if attempts >= MAX_DISPATCH_ATTEMPTS {
                        drop(state);
                        tracing::error!(
                            processor = %self.processor,
                            job_id = %entry.request.job_id,
                            attempts,
                            error = %e,
                            "Queued request abandoned"
                        );
                        return Some(DispatchOutcome::Abandoned {
                            job_id: entry.request.job_id,
                            error: e.to_string(),
                        });
                    }

                    tracing::warn!(
                        processor = %self.processor,
                        job_id = %entry.request.job_id,
                        attempts,
                        error = %e,
                        "Queued dispatch failed, requeueing"
                    );
                    if entry.request.priority >= PriorityClass::High {
                        state.queue.push_front(entry);
                    } else {
                        state.queue.push_back(entry);
                    }
                    drop(state);
                    tokio::time::sleep(self.backoff(attempts)).await;
                }
            }
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Job ids waiting, in dispatch order.
    pub async fn queued_job_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .queue
            .iter()
            .map(|q| q.request.job_id.clone())
            .collect()
    }

    pub async fn metrics(&self) -> LimiterMetrics {
        let state = self.state.lock().await;
        LimiterMetrics {
            processor: self.processor,
            current_concurrent: state.current,
            peak_concurrent: state.peak,
            total_requests: state.total_requests,
            throttled_requests: state.throttled,
            queue_length: state.queue.len(),
            queue_capacity: self.tier.queue_capacity,
            average_execution: state.average_execution(),
            in_cooldown: state.cooldown_until.is_some_and(|until| Instant::now() < until),
        }
    }

    /// Classify limiter health.
    ///
    /// Critical when the queue is over 90% full; degraded when concurrency is
    /// over 80% of the maximum or more than 10% of requests were throttled.
    pub async fn health(&self) -> HealthReport {
        let metrics = self.metrics().await;
        let concurrency = metrics.current_concurrent as f64 / self.tier.max_concurrent.max(1) as f64;

        let status = if metrics.queue_utilization() > 0.9 {
            HealthStatus::Critical
        } else if concurrency > 0.8 || metrics.throttle_rate() > 0.1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport { status, metrics }
    }

    async fn give_back_slot(&self) {
        let mut state = self.state.lock().await;
        state.current = state.current.saturating_sub(1);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.redispatch_delay * 2u32.pow(attempt.saturating_sub(1).min(4))
    }
}
