//! Single-worker job queue for administrator-initiated bulk re-verification.
//!
//! Jobs are processed strictly in FIFO order by exactly one worker task.
//! The worker holds the recheck coordinator for the span of each job, so
//! the auto-recheck scheduler defers while a job runs. Jobs are not
//! persisted; an in-flight job is abandoned at shutdown.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use poise::serenity_prelude::{GuildId, UserId};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::BulkConfig;
use crate::coordinator::RecheckCoordinator;
use crate::error::{BotError, Result};
use crate::models::MembershipStatus;
use crate::platform::{Delivery, MemberDirectory};
use crate::rsi::SharedRsiGateway;
use crate::storage::SharedVerificationStore;

/// What an admin asked for; turned into a job on enqueue.
#[derive(Debug, Clone)]
pub struct BulkJobRequest {
    pub guild_id: GuildId,
    pub target_user_ids: Vec<UserId>,
    pub invoker_id: UserId,
    /// Human description of how the targets were selected
    pub scope_label: String,
    /// Also re-fetch live snapshots instead of only reading stored ones
    pub recheck_rsi: bool,
}

/// One queued batch run. Mutated only by the worker that owns it and
/// discarded after delivery.
#[derive(Debug)]
pub struct BulkVerificationJob {
    pub job_id: u64,
    pub guild_id: GuildId,
    /// Ordered, deduplicated on enqueue
    pub target_user_ids: Vec<UserId>,
    pub invoker_id: UserId,
    pub scope_label: String,
    pub recheck_rsi: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_rows: Vec<StatusRow>,
    pub errors: Vec<UserError>,
}

/// Per-user result row
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub user_id: UserId,
    pub display_name: String,
    pub handle: Option<String>,
    pub status: RowStatus,
    pub note: Option<String>,
}

/// Row status; `Unknown` covers unverified members and failed rechecks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Main,
    Affiliate,
    NonMember,
    Unknown,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Main => "main",
            RowStatus::Affiliate => "affiliate",
            RowStatus::NonMember => "non_member",
            RowStatus::Unknown => "unknown",
        }
    }
}

impl From<MembershipStatus> for RowStatus {
    fn from(status: MembershipStatus) -> Self {
        match status {
            MembershipStatus::Main => RowStatus::Main,
            MembershipStatus::Affiliate => RowStatus::Affiliate,
            MembershipStatus::NonMember => RowStatus::NonMember,
        }
    }
}

/// Per-user failure recorded while a job runs
#[derive(Debug, Clone)]
pub struct UserError {
    pub user_id: UserId,
    pub message: String,
}

/// Counts by status for the final summary embed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub main: usize,
    pub affiliate: usize,
    pub non_member: usize,
    pub unknown: usize,
    pub errors: usize,
}

/// Handle for enqueueing jobs and observing the worker.
pub struct BulkVerificationQueue {
    tx: tokio::sync::mpsc::UnboundedSender<BulkVerificationJob>,
    next_job_id: AtomicU64,
    running: Arc<AtomicBool>,
}

impl BulkVerificationQueue {
    /// Enqueue a job; returns its id. Targets are deduplicated preserving
    /// first occurrence.
    pub fn enqueue(&self, request: BulkJobRequest) -> Result<u64> {
        let mut targets: Vec<UserId> = Vec::with_capacity(request.target_user_ids.len());
        for user_id in request.target_user_ids {
            if !targets.contains(&user_id) {
                targets.push(user_id);
            }
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = BulkVerificationJob {
            job_id,
            guild_id: request.guild_id,
            target_user_ids: targets,
            invoker_id: request.invoker_id,
            scope_label: request.scope_label,
            recheck_rsi: request.recheck_rsi,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status_rows: Vec::new(),
            errors: Vec::new(),
        };

        self.tx.send(job).map_err(|_| BotError::Internal {
            message: "Bulk verification worker is not running".to_string(),
        })?;
        info!("Queued bulk verification job #{}", job_id);
        Ok(job_id)
    }

    /// True only while a job is inside the worker's critical section.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The single worker that drains the queue.
struct BulkWorker {
    gateway: SharedRsiGateway,
    store: SharedVerificationStore,
    directory: Arc<dyn MemberDirectory>,
    delivery: Arc<dyn Delivery>,
    coordinator: RecheckCoordinator,
    config: BulkConfig,
    running: Arc<AtomicBool>,
}

/// Create the queue and spawn its worker task.
pub fn create_bulk_queue(
    gateway: SharedRsiGateway,
    store: SharedVerificationStore,
    directory: Arc<dyn MemberDirectory>,
    delivery: Arc<dyn Delivery>,
    coordinator: RecheckCoordinator,
    config: BulkConfig,
) -> (Arc<BulkVerificationQueue>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let running = Arc::new(AtomicBool::new(false));

    let worker = BulkWorker {
        gateway,
        store,
        directory,
        delivery,
        coordinator,
        config,
        running: running.clone(),
    };
    let handle = tokio::spawn(worker.run(rx));

    let queue = Arc::new(BulkVerificationQueue {
        tx,
        next_job_id: AtomicU64::new(1),
        running,
    });
    (queue, handle)
}

impl BulkWorker {
    async fn run(self, mut rx: tokio::sync::mpsc::UnboundedReceiver<BulkVerificationJob>) {
        while let Some(mut job) = rx.recv().await {
            // The guard keeps the auto-recheck scheduler deferring for the
            // whole job
            let _guard = self.coordinator.acquire().await;
            self.running.store(true, Ordering::SeqCst);

            job.started_at = Some(Utc::now());
            info!(
                "Starting bulk job #{} ({} targets, scope: {})",
                job.job_id,
                job.target_user_ids.len(),
                job.scope_label
            );

            // Nothing a single job does may kill the worker loop
            if let Err(e) = self.process_job(&mut job).await {
                error!("Bulk job #{} failed: {}", job.job_id, e);
                if let Err(de) = self
                    .delivery
                    .post_failure(job.guild_id, job.invoker_id, &e.to_string())
                    .await
                {
                    error!(
                        "Failed to report bulk job #{} failure to invoker: {}",
                        job.job_id, de
                    );
                }
            }

            self.running.store(false, Ordering::SeqCst);
        }
        debug!("Bulk verification worker stopped");
    }

    async fn process_job(&self, job: &mut BulkVerificationJob) -> Result<()> {
        let guild_name = self.directory.resolve_guild(job.guild_id).await?;

        let targets = job.target_user_ids.clone();
        let total = targets.len();
        let batch_size = self.config.batch_size.max(1);
        let num_batches = total.div_ceil(batch_size);
        let mut processed = 0usize;

        for (batch_index, batch) in targets.chunks(batch_size).enumerate() {
            self.process_batch(job, batch).await;
            processed += batch.len();

            let is_last = batch_index + 1 == num_batches;
            let cadence = self.config.progress_every_batches.max(1);
            if is_last || (batch_index + 1) % cadence == 0 {
                if let Err(e) = self
                    .delivery
                    .post_progress(job.guild_id, job.invoker_id, processed, total)
                    .await
                {
                    warn!("Failed to post progress for job #{}: {}", job.job_id, e);
                }
            }

            if !is_last {
                let delay = self.inter_batch_delay();
                if !delay.is_zero() {
                    debug!(
                        "Job #{}: sleeping {:?} before next batch",
                        job.job_id, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        job.completed_at = Some(Utc::now());
        let summary = summarize(job);
        let export = build_export(job);
        let filename = format!("bulk_verification_{}.csv", job.job_id);

        let channel = self
            .delivery
            .post_summary(
                job.guild_id,
                job.invoker_id,
                &job.scope_label,
                &summary,
                export,
                &filename,
            )
            .await?;
        info!(
            "Bulk job #{} for '{}' complete ({} rows, {} errors), posted to {}",
            job.job_id,
            guild_name,
            job.status_rows.len(),
            job.errors.len(),
            channel
        );
        Ok(())
    }

    async fn process_batch(&self, job: &mut BulkVerificationJob, batch: &[UserId]) {
        let mut rows: Vec<StatusRow> = Vec::with_capacity(batch.len());

        for &user_id in batch {
            let profile = match self.directory.resolve_member(job.guild_id, user_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    job.errors.push(UserError {
                        user_id,
                        message: format!("failed to resolve member: {}", e),
                    });
                    continue;
                }
            };

            let row = match self.store.load(user_id).await {
                Ok(Some(stored)) => StatusRow {
                    user_id,
                    display_name: profile.display_name,
                    handle: Some(stored.handle),
                    status: stored.status.into(),
                    note: None,
                },
                Ok(None) => StatusRow {
                    user_id,
                    display_name: profile.display_name,
                    handle: None,
                    status: RowStatus::Unknown,
                    note: Some("no RSI handle on record".to_string()),
                },
                Err(e) => {
                    job.errors.push(UserError {
                        user_id,
                        message: format!("failed to read stored record: {}", e),
                    });
                    StatusRow {
                        user_id,
                        display_name: profile.display_name,
                        handle: None,
                        status: RowStatus::Unknown,
                        note: Some(e.to_string()),
                    }
                }
            };
            rows.push(row);
        }

        if job.recheck_rsi {
            // Unordered fan-out, bounded by the gateway's shared permit
            // pool; results re-associate to rows by position
            let checks = rows.iter().map(|row| {
                let gateway = self.gateway.clone();
                let user_id = row.user_id;
                let handle = row.handle.clone();
                async move {
                    // No handle: keep the unknown row, never fetch
                    match handle {
                        Some(handle) => Some(gateway.get_snapshot(user_id, &handle, false).await),
                        None => None,
                    }
                }
            });
            let results = join_all(checks).await;

            for (row, result) in rows.iter_mut().zip(results) {
                match result {
                    None => {}
                    Some(Ok(snapshot)) if snapshot.is_clean() => {
                        row.handle = Some(snapshot.handle.clone());
                        row.status = snapshot.status.into();
                        row.note = None;
                    }
                    Some(Ok(snapshot)) => {
                        let message = snapshot
                            .error
                            .unwrap_or_else(|| "recheck failed".to_string());
                        row.status = RowStatus::Unknown;
                        row.note = Some(message.clone());
                        job.errors.push(UserError {
                            user_id: row.user_id,
                            message,
                        });
                    }
                    Some(Err(BotError::HandleNotFound { handle })) => {
                        let message = format!("handle '{}' no longer exists", handle);
                        row.status = RowStatus::Unknown;
                        row.note = Some(message.clone());
                        job.errors.push(UserError {
                            user_id: row.user_id,
                            message,
                        });
                    }
                    Some(Err(e)) => {
                        let message = e.to_string();
                        row.status = RowStatus::Unknown;
                        row.note = Some(message.clone());
                        job.errors.push(UserError {
                            user_id: row.user_id,
                            message,
                        });
                    }
                }
            }
        }

        job.status_rows.extend(rows);
    }

    /// Randomized spacing between batches, uniform in the configured range.
    fn inter_batch_delay(&self) -> Duration {
        let min = self.config.inter_batch_delay_min_seconds;
        let max = self.config.inter_batch_delay_max_seconds.max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(min..=max);
        Duration::from_secs(secs)
    }
}

/// Counts by status plus the error total.
fn summarize(job: &BulkVerificationJob) -> JobSummary {
    let mut summary = JobSummary {
        total: job.target_user_ids.len(),
        errors: job.errors.len(),
        ..JobSummary::default()
    };
    for row in &job.status_rows {
        match row.status {
            RowStatus::Main => summary.main += 1,
            RowStatus::Affiliate => summary.affiliate += 1,
            RowStatus::NonMember => summary.non_member += 1,
            RowStatus::Unknown => summary.unknown += 1,
        }
    }
    summary
}

/// Full per-user export as CSV bytes.
fn build_export(job: &BulkVerificationJob) -> Vec<u8> {
    let mut out = String::from("user_id,display_name,handle,status,note\n");
    for row in &job.status_rows {
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            row.user_id,
            csv_field(&row.display_name),
            csv_field(row.handle.as_deref().unwrap_or("")),
            row.status.as_str(),
            csv_field(row.note.as_deref().unwrap_or("")),
        ));
    }
    for error in &job.errors {
        out.push_str(&format!(
            "{},,,error,{}\n",
            error.user_id,
            csv_field(&error.message),
        ));
    }
    out.into_bytes()
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
