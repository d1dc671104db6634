//! In-memory retry scheduler for failed renewal submissions.
//!
//! The queue owns every request handed to it. Callers observe entries through
//! [`RetryQueue::get`], which returns a copy, so `retry_count`,
//! `next_retry_at` and `status` are only ever written here.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{RenewalRequest, RenewalStatus};

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Exponential backoff capped at `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows `retry_count` earlier failures.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() {
            return self.max_interval;
        }
        Duration::try_from_secs_f64(secs).map_or(self.max_interval, |delay| {
            delay.min(self.max_interval)
        })
    }
}

/// Submission callback re-invoked by the queue.
pub trait RenewalFn: Send + Sync {
    fn renew(&self, request: RenewalRequest) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<F, Fut> RenewalFn for F
where
    F: Fn(RenewalRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn renew(&self, request: RenewalRequest) -> impl Future<Output = anyhow::Result<()>> + Send {
        self(request)
    }
}

pub struct RetryQueue<F> {
    requests: RwLock<HashMap<String, RenewalRequest>>,
    policy: RetryPolicy,
    sweep_interval: Duration,
    renewal_fn: F,
    stop_tx: watch::Sender<bool>,
}

impl<F: RenewalFn> RetryQueue<F> {
    #[must_use]
    pub fn new(policy: RetryPolicy, renewal_fn: F) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            requests: RwLock::new(HashMap::new()),
            policy,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            renewal_fn,
            stop_tx,
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        if !sweep_interval.is_zero() {
            self.sweep_interval = sweep_interval;
        }
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedules `request` for its next attempt, replacing any entry with the
    /// same request ID.
    pub async fn add(&self, request: RenewalRequest) {
        self.add_at(request, OffsetDateTime::now_utc()).await;
    }

    pub async fn add_at(&self, mut request: RenewalRequest, now: OffsetDateTime) {
        let delay = self.policy.backoff(request.retry_count);
        let next_retry_at = now.saturating_add(
            time::Duration::try_from(delay).unwrap_or(time::Duration::MAX),
        );
        request.next_retry_at = Some(next_retry_at);
        request.retry_count = request.retry_count.saturating_add(1);

        info!(
            request_id = %request.request_id,
            retry_count = request.retry_count,
            next_retry_in = %humantime::format_duration(delay),
            "Renewal request scheduled for retry"
        );
        self.requests
            .write()
            .await
            .insert(request.request_id.clone(), request);
    }

    /// Drops the request if present.
    pub async fn remove(&self, request_id: &str) {
        if self.requests.write().await.remove(request_id).is_some() {
            debug!(request_id, "Renewal request removed from retry queue");
        }
    }

    pub async fn get(&self, request_id: &str) -> Option<RenewalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    pub async fn size(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Sweeps the queue every sweep interval until `shutdown` flips or
    /// [`RetryQueue::stop`] is called.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut stop = self.stop_tx.subscribe();
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(sweep_interval = ?self.sweep_interval, "Starting renewal retry queue");

        loop {
            if *shutdown.borrow() || *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    // A sweep may be stuck on a slow submission.
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = stop.changed() => break,
                        () = self.process_retries() => {}
                    }
                }
            }
        }
        info!("Renewal retry queue stopped");
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Attempts every request whose retry time has passed.
    pub async fn process_retries(&self) {
        self.process_retries_at(OffsetDateTime::now_utc()).await;
    }

    pub async fn process_retries_at(&self, now: OffsetDateTime) {
        let due: Vec<String> = {
            let requests = self.requests.read().await;
            requests
                .values()
                .filter(|request| request.status != RenewalStatus::Submitted)
                .filter(|request| request.next_retry_at.is_none_or(|at| at <= now))
                .map(|request| request.request_id.clone())
                .collect()
        };

        for request_id in due {
            let Some(request) = self.mark_submitted(&request_id).await else {
                continue;
            };
            info!(
                request_id = %request_id,
                retry_count = request.retry_count,
                "Retrying renewal request"
            );

            match self.renewal_fn.renew(request).await {
                Ok(()) => {
                    self.finish(&request_id).await;
                    info!(request_id = %request_id, "Renewal retry succeeded");
                }
                Err(err) => {
                    warn!(
                        event = "certificate.renewal.failed",
                        request_id = %request_id,
                        "Renewal retry failed: {err:#}"
                    );
                    if let Some(mut failed) = self.get(&request_id).await {
                        failed.status = RenewalStatus::Failed;
                        self.add_at(failed, now).await;
                    }
                }
            }
        }
    }

    async fn mark_submitted(&self, request_id: &str) -> Option<RenewalRequest> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(request_id)?;
        if request.status == RenewalStatus::Submitted {
            return None;
        }
        request.status = RenewalStatus::Submitted;
        Some(request.clone())
    }

    async fn finish(&self, request_id: &str) {
        let mut requests = self.requests.write().await;
        if let Some(request) = requests.get_mut(request_id) {
            request.status = RenewalStatus::Completed;
        }
        requests.remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::agent::types::SecurityProofType;

    fn request(id: &str) -> RenewalRequest {
        RenewalRequest {
            request_id: id.to_string(),
            device_id: "dev-1".to_string(),
            old_certificate_serial: "01".to_string(),
            csr: b"csr".to_vec(),
            security_proof_type: SecurityProofType::ValidCertificate,
            created_at: OffsetDateTime::now_utc(),
            retry_count: 0,
            next_retry_at: None,
            status: RenewalStatus::Pending,
        }
    }

    fn always_ok(_request: RenewalRequest) -> std::future::Ready<anyhow::Result<()>> {
        std::future::ready(Ok(()))
    }

    #[test]
    fn test_backoff_is_monotone_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for count in 0..64 {
            let delay = policy.backoff(count);
            assert!(delay >= previous, "count={count}");
            assert!(delay <= policy.max_interval);
            previous = delay;
        }
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(u32::MAX), policy.max_interval);
    }

    #[tokio::test]
    async fn test_add_schedules_and_increments() {
        let queue = RetryQueue::new(RetryPolicy::default(), always_ok);
        let now = OffsetDateTime::now_utc();

        queue.add_at(request("a"), now).await;

        let stored = queue.get("a").await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.next_retry_at, Some(now + time::Duration::minutes(1)));
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn test_add_remove_get_is_not_found() {
        let queue = RetryQueue::new(RetryPolicy::default(), always_ok);

        queue.add(request("a")).await;
        queue.remove("a").await;
        queue.remove("a").await;

        assert!(queue.get("a").await.is_none());
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn test_get_returns_a_copy() {
        let queue = RetryQueue::new(RetryPolicy::default(), always_ok);
        queue.add(request("a")).await;

        let mut copy = queue.get("a").await.unwrap();
        copy.retry_count = 99;

        assert_eq!(queue.get("a").await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_success_removes_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = RetryQueue::new(RetryPolicy::default(), {
            let calls = Arc::clone(&calls);
            move |request: RenewalRequest| {
                let calls = Arc::clone(&calls);
                async move {
                    assert_eq!(request.status, RenewalStatus::Submitted);
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        });
        let now = OffsetDateTime::now_utc();
        queue.add_at(request("a"), now).await;

        queue.process_retries_at(now).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        queue
            .process_retries_at(now + time::Duration::minutes(1))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_growing_delay() {
        let queue = RetryQueue::new(RetryPolicy::default(), |_request: RenewalRequest| async {
            Err::<(), _>(anyhow::anyhow!("service unavailable"))
        });
        let start = OffsetDateTime::now_utc();
        queue.add_at(request("a"), start).await;

        let mut due = queue.get("a").await.unwrap().next_retry_at.unwrap();
        let mut last_delay = time::Duration::ZERO;
        for sweep in 1..=8_u32 {
            queue.process_retries_at(due).await;

            let current = queue.get("a").await.unwrap();
            assert_eq!(current.retry_count, sweep + 1);
            assert_eq!(current.status, RenewalStatus::Failed);
            let next = current.next_retry_at.unwrap();
            let delay = next - due;
            assert!(next > due, "sweep={sweep}");
            assert!(delay >= last_delay, "sweep={sweep}");
            assert!(delay <= time::Duration::HOUR);
            last_delay = delay;
            due = next;
        }
        assert_eq!(last_delay, time::Duration::HOUR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(
            RetryQueue::new(RetryPolicy::default(), always_ok)
                .with_sweep_interval(Duration::from_secs(1)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown_tx.send(true).unwrap();

        task.await.unwrap();
    }

    fn hanging_queue(calls: Arc<AtomicUsize>) -> RetryQueue<impl RenewalFn> {
        RetryQueue::new(RetryPolicy::default(), move |_request: RenewalRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<anyhow::Result<()>>()
        })
        .with_sweep_interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_in_flight_sweep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(hanging_queue(Arc::clone(&calls)));
        queue
            .add_at(request("a"), OffsetDateTime::now_utc() - time::Duration::hours(2))
            .await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run loop ignored shutdown during a sweep")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_in_flight_sweep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(hanging_queue(Arc::clone(&calls)));
        queue
            .add_at(request("a"), OffsetDateTime::now_utc() - time::Duration::hours(2))
            .await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        queue.stop();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run loop ignored stop during a sweep")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_run_loop() {
        let queue = Arc::new(RetryQueue::new(RetryPolicy::default(), always_ok));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.run(shutdown_rx).await }
        });

        queue.stop();

        task.await.unwrap();
    }
}
