use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::agent::monitor::{self, Monitor, RenewalTrigger};
use crate::agent::renewer::{RenewalError, Renewer};
use crate::agent::retry::{RenewalFn, RetryQueue};
use crate::agent::types::{RenewalRequest, RenewalStatus};
use crate::agent::decision;
use crate::config::Settings;
use crate::metrics::RotationMetrics;
use crate::submit::HttpSubmitter;

const TRIGGER_CHANNEL_CAPACITY: usize = 1;

pub const FAILURE_KEY_LOAD: &str = "key_load";
pub const FAILURE_CSR_GENERATION: &str = "csr_generation";
pub const FAILURE_SUBMISSION: &str = "submission";

/// Queue callback that resubmits a request and records the outcome.
pub struct SubmitRetry {
    submitter: Arc<HttpSubmitter>,
    metrics: Arc<dyn RotationMetrics>,
}

impl RenewalFn for SubmitRetry {
    fn renew(&self, request: RenewalRequest) -> impl Future<Output = anyhow::Result<()>> + Send {
        let submitter = Arc::clone(&self.submitter);
        let metrics = Arc::clone(&self.metrics);
        async move {
            match submitter.submit_and_install(&request).await {
                Ok(_) => {
                    record_success(metrics.as_ref(), &request);
                    Ok(())
                }
                Err(err) => {
                    metrics.inc_renewal_failures(FAILURE_SUBMISSION);
                    Err(err)
                }
            }
        }
    }
}

/// Everything the trigger consumer needs to turn a trigger into a rotation.
pub struct Rotation {
    settings: Arc<Settings>,
    renewer: Renewer,
    submitter: Arc<HttpSubmitter>,
    queue: Arc<RetryQueue<SubmitRetry>>,
    metrics: Arc<dyn RotationMetrics>,
}

impl Rotation {
    #[must_use]
    pub fn new(settings: Arc<Settings>, metrics: Arc<dyn RotationMetrics>) -> Self {
        let submitter = Arc::new(HttpSubmitter::from_settings(&settings));
        let queue = RetryQueue::new(
            settings.retry_policy(),
            SubmitRetry {
                submitter: Arc::clone(&submitter),
                metrics: Arc::clone(&metrics),
            },
        )
        .with_sweep_interval(settings.retry.sweep_interval);
        Self {
            renewer: Renewer::new(settings.device_id.clone(), settings.paths.key.clone()),
            submitter,
            queue: Arc::new(queue),
            metrics,
            settings,
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<RetryQueue<SubmitRetry>> {
        &self.queue
    }

    /// Generates and submits a renewal for `trigger`.
    ///
    /// Returns `Ok(false)` when the trigger was skipped because a renewal is
    /// already queued or the certificate was rotated since the trigger fired.
    ///
    /// # Errors
    /// Returns an error if the request cannot be generated or submitted. A
    /// failed submission is handed to the retry queue before returning.
    pub async fn handle_trigger(&self, trigger: &RenewalTrigger) -> anyhow::Result<bool> {
        let pending = self.queue.size().await;
        if pending > 0 {
            info!(
                event = "certificate.renewal.skipped",
                reason = "renewal_in_progress",
                pending,
                "Renewal already pending retry; ignoring trigger"
            );
            return Ok(false);
        }
        if !self.still_due(trigger).await {
            info!(
                event = "certificate.renewal.skipped",
                reason = "certificate_already_rotated",
                "Certificate no longer due for renewal; ignoring trigger"
            );
            return Ok(false);
        }

        info!(
            event = "certificate.renewal.initiated",
            cert_serial = %trigger.cert_metadata.serial_number,
            reason = %trigger.reason,
            "Starting certificate renewal"
        );

        let request = match self
            .renewer
            .generate_renewal_request(&trigger.cert_metadata)
            .await
        {
            Ok(request) => request,
            Err(err) => {
                self.metrics.inc_renewal_failures(failure_reason(&err));
                error!(
                    event = "certificate.renewal.failed",
                    reason = err.reason(),
                    "Failed to generate renewal request: {err}"
                );
                return Err(err.into());
            }
        };

        match self.submitter.submit_and_install(&request).await {
            Ok(_) => {
                record_success(self.metrics.as_ref(), &request);
                Ok(true)
            }
            Err(err) => {
                self.metrics.inc_renewal_failures(FAILURE_SUBMISSION);
                warn!(
                    event = "certificate.renewal.failed",
                    request_id = %request.request_id,
                    reason = FAILURE_SUBMISSION,
                    "Renewal submission failed, queued for retry: {err:#}"
                );
                let mut failed = request;
                failed.status = RenewalStatus::Failed;
                self.queue.add(failed).await;
                Err(err)
            }
        }
    }

    async fn still_due(&self, trigger: &RenewalTrigger) -> bool {
        match monitor::load_certificate_metadata(&trigger.cert_metadata.file_path).await {
            Ok(current) => {
                current.fingerprint == trigger.cert_metadata.fingerprint
                    || decision::should_renew(
                        current.not_after,
                        self.settings.rotation.renewal_threshold_days,
                    )
            }
            Err(_) => true,
        }
    }
}

fn failure_reason(err: &RenewalError) -> &'static str {
    match err {
        RenewalError::KeyLoad { .. } => FAILURE_KEY_LOAD,
        RenewalError::Csr(_) => FAILURE_CSR_GENERATION,
    }
}

fn record_success(metrics: &dyn RotationMetrics, request: &RenewalRequest) {
    metrics.inc_renewal_successes();
    let elapsed = OffsetDateTime::now_utc() - request.created_at;
    metrics.observe_rotation_duration(elapsed.unsigned_abs());
}

/// Runs the agent until ctrl-c or SIGTERM.
///
/// # Errors
/// Returns an error if a component task fails or panics.
pub async fn run_daemon(
    settings: Arc<Settings>,
    metrics: Arc<dyn RotationMetrics>,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_handle = tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown().await {
            error!("Shutdown signal handler error: {err}");
        }
        let _ = shutdown_tx.send(true);
    });

    let result = run_agent(settings, metrics, shutdown_rx).await;
    shutdown_handle.abort();
    result
}

/// Wires the monitor, the trigger consumer and the retry queue, and runs them
/// until `shutdown` flips.
///
/// # Errors
/// Returns an error if a component task panics.
pub async fn run_agent(
    settings: Arc<Settings>,
    metrics: Arc<dyn RotationMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (trigger_tx, mut trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
    let monitor = Arc::new(Monitor::new(
        settings.paths.cert.clone(),
        settings.rotation.monitor_interval,
        settings.rotation.renewal_threshold_days,
        trigger_tx,
        Arc::clone(&metrics),
    ));
    let rotation = Rotation::new(Arc::clone(&settings), metrics);

    info!(
        device_id = %settings.device_id,
        server = %settings.server,
        "Certificate rotation agent started"
    );

    let monitor_handle = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });
    let queue_handle = tokio::spawn({
        let queue = Arc::clone(rotation.queue());
        let shutdown = shutdown.clone();
        async move { queue.run(shutdown).await }
    });

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            trigger = trigger_rx.recv() => {
                let Some(trigger) = trigger else { break };
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    result = rotation.handle_trigger(&trigger) => {
                        if let Err(err) = result {
                            error!("Certificate renewal failed: {err:#}");
                        }
                    }
                }
            }
        }
    }

    info!("Shutdown signal received. Stopping rotation agent.");
    monitor.stop();
    rotation.queue().stop();
    monitor_handle
        .await
        .context("Certificate monitor task join error")?;
    queue_handle
        .await
        .context("Retry queue task join error")?;
    Ok(())
}

/// Performs one expiration check and, if due, one renewal attempt.
///
/// # Errors
/// Returns an error if the certificate cannot be read or the renewal fails.
pub async fn run_oneshot(
    settings: Arc<Settings>,
    metrics: Arc<dyn RotationMetrics>,
) -> anyhow::Result<()> {
    let metadata = monitor::load_certificate_metadata(&settings.paths.cert).await?;
    metrics.set_cert_expiration_time(metadata.not_after.unix_timestamp());
    let threshold_days =
        decision::effective_threshold_days(settings.rotation.renewal_threshold_days);
    if !decision::should_renew(metadata.not_after, threshold_days) {
        let remaining = decision::time_until_renewal(metadata.not_after, threshold_days);
        info!(
            cert_serial = %metadata.serial_number,
            renewal_in = %humantime::format_duration(remaining),
            "Certificate not due for renewal"
        );
        return Ok(());
    }

    metrics.inc_renewal_attempts();
    let time_to_expiry = metadata.not_after - OffsetDateTime::now_utc();
    let trigger = RenewalTrigger {
        reason: format!("Oneshot renewal (threshold: {threshold_days} days)"),
        cert_metadata: metadata,
        time_to_expiry,
    };
    Rotation::new(settings, metrics)
        .handle_trigger(&trigger)
        .await
        .map(|_| ())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {e}"))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
            }
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {e}"))?;
    }

    Ok(())
}
