use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::decision;
use crate::cert::{self, CertificateMetadata};
use crate::metrics::RotationMetrics;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Why and when the monitor asked for a renewal.
#[derive(Debug, Clone)]
pub struct RenewalTrigger {
    pub cert_metadata: CertificateMetadata,
    pub reason: String,
    pub time_to_expiry: time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    NotDue { time_until_renewal: Duration },
    Triggered,
    Skipped,
}

/// Periodically checks the active certificate and publishes renewal triggers.
///
/// The trigger channel is expected to have capacity 1. A full channel means a
/// renewal is already pending, so the check is skipped instead of waiting.
pub struct Monitor {
    cert_path: PathBuf,
    interval: Duration,
    threshold_days: u32,
    renewal_tx: mpsc::Sender<RenewalTrigger>,
    metrics: Arc<dyn RotationMetrics>,
    stop_tx: watch::Sender<bool>,
}

impl Monitor {
    #[must_use]
    pub fn new(
        cert_path: PathBuf,
        interval: Duration,
        threshold_days: u32,
        renewal_tx: mpsc::Sender<RenewalTrigger>,
        metrics: Arc<dyn RotationMetrics>,
    ) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_MONITOR_INTERVAL
        } else {
            interval
        };
        let (stop_tx, _) = watch::channel(false);
        Self {
            cert_path,
            interval,
            threshold_days,
            renewal_tx,
            metrics,
            stop_tx,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs the check loop until `shutdown` flips or [`Monitor::stop`] is called.
    ///
    /// The first check happens immediately. Check failures are logged and the
    /// next tick retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut stop = self.stop_tx.subscribe();
        info!(
            interval = ?self.interval,
            cert_path = %self.cert_path.display(),
            "Starting certificate expiration monitor"
        );

        // The first tick completes immediately.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut initial = true;

        let by_shutdown = loop {
            if *shutdown.borrow() {
                break true;
            }
            if *stop.borrow() {
                break false;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break true,
                _ = stop.changed() => break false,
                _ = ticker.tick() => {
                    let result = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break true,
                        _ = stop.changed() => break false,
                        result = self.check_certificate_expiration() => result,
                    };
                    match result {
                        Err(err) if initial => {
                            warn!("Initial certificate expiration check failed: {err:#}");
                        }
                        Err(err) => error!("Certificate expiration check failed: {err:#}"),
                        Ok(_) => {}
                    }
                    initial = false;
                }
            }
        };

        if by_shutdown {
            info!("Certificate monitor stopping due to shutdown signal");
        } else {
            info!("Certificate monitor stopped");
        }
    }

    /// Requests the run loop to exit before its next tick.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Loads the certificate and publishes a trigger when renewal is due.
    ///
    /// # Errors
    /// Returns an error if the certificate cannot be read or parsed, or if the
    /// trigger consumer has gone away.
    pub async fn check_certificate_expiration(&self) -> anyhow::Result<CheckOutcome> {
        let metadata = load_certificate_metadata(&self.cert_path).await?;
        self.metrics
            .set_cert_expiration_time(metadata.not_after.unix_timestamp());

        let now = OffsetDateTime::now_utc();
        let time_to_expiry = metadata.not_after - now;
        let threshold_days = decision::effective_threshold_days(self.threshold_days);

        debug!(
            serial = %metadata.serial_number,
            not_after = %format_time(metadata.not_after),
            time_to_expiry = %describe(time_to_expiry),
            threshold_days,
            "Certificate expiration check"
        );

        if !decision::should_renew_at(metadata.not_after, threshold_days, now) {
            return Ok(CheckOutcome::NotDue {
                time_until_renewal: decision::time_until_renewal_at(
                    metadata.not_after,
                    threshold_days,
                    now,
                ),
            });
        }

        self.metrics.inc_renewal_attempts();
        let serial = metadata.serial_number.clone();
        let not_after = metadata.not_after;
        let trigger = RenewalTrigger {
            reason: format!(
                "Certificate expires in {} (threshold: {threshold_days} days)",
                describe(time_to_expiry)
            ),
            cert_metadata: metadata,
            time_to_expiry,
        };

        match self.renewal_tx.try_send(trigger) {
            Ok(()) => {
                info!(
                    event = "certificate.expiration.detected",
                    cert_serial = %serial,
                    not_after = %format_time(not_after),
                    time_to_expiry = %describe(time_to_expiry),
                    threshold_days,
                    "Certificate expiring soon - renewal triggered"
                );
                Ok(CheckOutcome::Triggered)
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    event = "certificate.renewal.skipped",
                    cert_serial = %serial,
                    reason = "renewal_channel_full",
                    time_to_expiry = %describe(time_to_expiry),
                    "Renewal channel full, skipping trigger (renewal may already be in progress)"
                );
                Ok(CheckOutcome::Skipped)
            }
            Err(TrySendError::Closed(_)) => {
                anyhow::bail!("Renewal trigger channel is closed")
            }
        }
    }
}

/// Reads and parses the certificate at `path`.
///
/// # Errors
/// Returns an error if the file cannot be read or does not hold a certificate.
pub async fn load_certificate_metadata(path: &Path) -> anyhow::Result<CertificateMetadata> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read certificate file {}", path.display()))?;
    cert::metadata_from_pem(path, &bytes)
        .with_context(|| format!("Failed to parse certificate {}", path.display()))
}

fn describe(duration: time::Duration) -> String {
    let magnitude =
        humantime::format_duration(Duration::from_secs(duration.unsigned_abs().as_secs()));
    if duration.is_negative() {
        format!("-{magnitude}")
    } else {
        magnitude.to_string()
    }
}

fn format_time(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}
