//! The per-workflow pipeline: stage, claim and process, alert, health check.
//!
//! One [`Pipeline`] exists per workflow and is shared by every tick that
//! runs it. Stage, claim and alert are each guarded so an overlapping tick
//! skips a phase that is still running. The health check is unguarded.
//! A failing phase never stops the phases after it.

use super::guard::PhaseGuards;
use super::processor::{HookProcessor, RecordProcessor, Rejection};
use crate::alert::{AlertSink, FileAlertSink, LogAlertSink, QuarantineReport};
use crate::clock::Clock;
use crate::config::WorkflowConfig;
use crate::error::Result;
use crate::ingest::{Aggregator, BatchRef, BatchSource, Disposition, DirectorySource};
use crate::model::{EntryId, QueueEntry, QueueName, RawRow};
use crate::monitor::{BackpressureMonitor, Health};
use crate::store::{QueueStore, Upsert};
use crate::telemetry::metrics;
use crate::telemetry::pipeline::{
    record_entry_result, record_phase, start_entry_span, start_tick_span,
};
use opentelemetry::KeyValue;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// Limits a pipeline runs under.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub claim_batch_size: usize,
    pub report_limit: usize,
    pub monitor_scan_limit: usize,
    pub processor_timeout: Duration,
}

impl From<&WorkflowConfig> for PipelineSettings {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            claim_batch_size: config.claim_batch_size,
            report_limit: config.report_limit(),
            monitor_scan_limit: config.monitor_scan_limit(),
            processor_timeout: config.processor_timeout,
        }
    }
}

/// The external parts a pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn BatchSource>,
    pub processor: Arc<dyn RecordProcessor>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// Directory source, hook processor, and a file or log alert sink.
    ///
    /// `clock` drives the hook's accepted-payload cache when one is
    /// configured.
    pub fn from_config(config: &WorkflowConfig, clock: Arc<dyn Clock>) -> Self {
        let alerts: Arc<dyn AlertSink> = match &config.alerts.dir {
            Some(dir) => Arc::new(FileAlertSink::new(dir)),
            None => Arc::new(LogAlertSink),
        };
        let mut processor = HookProcessor::new(&config.processor);
        if let Some(ttl) = config.processor.skip_unchanged_for {
            processor = processor.with_accepted_cache(ttl, clock);
        }
        Self {
            source: Arc::new(DirectorySource::new(&config.source)),
            processor: Arc::new(processor),
            alerts,
        }
    }
}

/// Outcome of a guarded phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase<T> {
    Ran(T),
    /// Another tick was still running this phase.
    Skipped,
}

impl<T> Phase<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            Phase::Ran(report) => Some(report),
            Phase::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub batches: usize,
    pub processed: usize,
    pub bad: usize,
    /// Records written to the queue.
    pub records: usize,
    /// Records left alone because a worker held them.
    pub skipped_claimed: Vec<SkippedRecord>,
}

/// A staged record that was not written because its entry was claimed.
///
/// The batch is still routed processed; the claimed entry keeps its older
/// payload until it is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub batch: String,
    pub id: EntryId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub claimed: usize,
    pub completed: usize,
    pub quarantined: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertReport {
    pub reported: usize,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub stage: Phase<StageReport>,
    pub process: Phase<ProcessReport>,
    pub alert: Phase<AlertReport>,
    pub health: Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryResult {
    Completed,
    Quarantined,
}

impl EntryResult {
    fn as_str(self) -> &'static str {
        match self {
            EntryResult::Completed => "completed",
            EntryResult::Quarantined => "quarantined",
        }
    }
}

struct Inner {
    workflow: String,
    queue: QueueName,
    settings: PipelineSettings,
    store: QueueStore,
    aggregator: Aggregator,
    collaborators: Collaborators,
    monitor: BackpressureMonitor,
    guards: PhaseGuards,
    /// Claimed entries whose release failed; retried by the next claim phase.
    unreleased: Mutex<Vec<QueueEntry>>,
}

/// A workflow's pipeline. Clones share state and guards.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(config: &WorkflowConfig, store: QueueStore, collaborators: Collaborators) -> Self {
        let monitor = BackpressureMonitor::new(
            config.name.clone(),
            config.max_queue_age,
            config.alert_cooldown,
            Arc::clone(store.clock()),
        );
        Self {
            inner: Arc::new(Inner {
                workflow: config.name.clone(),
                queue: config.queue_name(),
                settings: PipelineSettings::from(config),
                store,
                aggregator: Aggregator::new(config.layout.clone()),
                collaborators,
                monitor,
                guards: PhaseGuards::default(),
                unreleased: Mutex::default(),
            }),
        }
    }

    pub fn workflow(&self) -> &str {
        &self.inner.workflow
    }

    pub fn queue(&self) -> &QueueName {
        &self.inner.queue
    }

    pub fn store(&self) -> &QueueStore {
        &self.inner.store
    }

    pub fn guards(&self) -> &PhaseGuards {
        &self.inner.guards
    }

    /// Run every phase once.
    ///
    /// Every phase and the health check run even when an earlier one fails.
    /// Each failure is logged; the first is returned.
    pub async fn tick(&self) -> Result<TickReport> {
        let tick_id = Uuid::new_v4();
        let span = start_tick_span(&self.inner.workflow, &tick_id);

        async {
            let started = Instant::now();

            record_phase(&span, "stage");
            let stage = self.stage().await;
            self.log_failure("stage", &stage);

            record_phase(&span, "claim");
            let process = self.process().await;
            self.log_failure("claim", &process);

            record_phase(&span, "alert");
            let alert = self.alert().await;
            self.log_failure("alert", &alert);

            record_phase(&span, "health");
            let health = self.health_check().await;
            self.log_failure("health", &health);

            metrics::operation_duration_ms().record(
                started.elapsed().as_millis() as f64,
                &[KeyValue::new("operation", "pipeline.tick")],
            );

            Ok(TickReport {
                stage: stage?,
                process: process?,
                alert: alert?,
                health: health?,
            })
        }
        .instrument(span.clone())
        .await
    }

    fn log_failure<T>(&self, phase: &'static str, result: &Result<T>) {
        if let Err(e) = result {
            error!(workflow = %self.inner.workflow, phase, error = %e, "phase failed");
        }
    }

    /// Discover new batches and stage their records.
    pub async fn stage(&self) -> Result<Phase<StageReport>> {
        let Some(_token) = self.inner.guards.stage.try_enter() else {
            debug!(workflow = %self.inner.workflow, "stage already running, skipping");
            return Ok(Phase::Skipped);
        };

        let source = &self.inner.collaborators.source;
        let mut report = StageReport::default();

        for batch in source.list_batches().await? {
            info!(workflow = %self.inner.workflow, batch = %batch.id, "staging batch");
            report.batches += 1;

            let disposition = match source.fetch_rows(&batch).await {
                Ok(rows) => self.stage_rows(&batch, rows, &mut report).await,
                Err(e) => {
                    error!(batch = %batch.id, error = %e, "cannot read batch");
                    Disposition::Bad
                }
            };

            source.route(&batch, disposition).await?;
            match disposition {
                Disposition::Processed => report.processed += 1,
                Disposition::Bad => report.bad += 1,
            }
            metrics::batches_routed().add(
                1,
                &[
                    KeyValue::new("workflow", self.inner.workflow.clone()),
                    KeyValue::new("disposition", disposition.as_str()),
                ],
            );
        }

        Ok(Phase::Ran(report))
    }

    /// Aggregate and upsert one batch. Stops at the first failed upsert and
    /// marks the whole batch bad.
    async fn stage_rows(
        &self,
        batch: &BatchRef,
        rows: Vec<RawRow>,
        report: &mut StageReport,
    ) -> Disposition {
        let aggregation = self.inner.aggregator.aggregate(&batch.id, rows);
        if aggregation.skipped > 0 {
            warn!(batch = %batch.id, skipped = aggregation.skipped, "rows skipped during aggregation");
        }

        let total = aggregation.records.len();
        let mut staged = 0;
        let mut disposition = Disposition::Processed;

        for (key, record) in aggregation.records {
            let id = EntryId::new(key);
            let upsert = match record.to_payload() {
                Ok(payload) => self.inner.store.upsert(&self.inner.queue, &id, payload).await,
                Err(e) => Err(e.into()),
            };

            match upsert {
                Ok(Upsert::Written) => staged += 1,
                Ok(Upsert::SkippedClaimed) => {
                    info!(batch = %batch.id, id = %id, "entry claimed, record not restaged");
                    report.skipped_claimed.push(SkippedRecord {
                        batch: batch.id.clone(),
                        id,
                    });
                }
                Err(e) => {
                    error!(
                        batch = %batch.id,
                        staged,
                        total,
                        error = %e,
                        "upsert failed, batch marked bad"
                    );
                    disposition = Disposition::Bad;
                    break;
                }
            }
        }

        report.records += staged;
        metrics::records_staged().add(
            staged as u64,
            &[KeyValue::new("workflow", self.inner.workflow.clone())],
        );
        disposition
    }

    /// Claim and process entries until the queue has no unclaimed work.
    ///
    /// If the store fails mid-batch, the entries of that batch not yet
    /// handed to the processor are released. The entry whose store update
    /// failed stays claimed, since its processor already ran; the health
    /// check reports it once it ages past the limit.
    pub async fn process(&self) -> Result<Phase<ProcessReport>> {
        let Some(_token) = self.inner.guards.claim.try_enter() else {
            debug!(workflow = %self.inner.workflow, "claim already running, skipping");
            return Ok(Phase::Skipped);
        };

        let stranded = std::mem::take(&mut *self.unreleased());
        self.release_unprocessed(stranded).await;

        let mut report = ProcessReport::default();
        loop {
            let batch = self
                .inner
                .store
                .claim_batch(&self.inner.queue, self.inner.settings.claim_batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            info!(workflow = %self.inner.workflow, count = batch.len(), "claimed entries");
            report.claimed += batch.len();

            let mut pending = batch.into_iter();
            while let Some(entry) = pending.next() {
                match self.process_entry(entry).await {
                    Ok(EntryResult::Completed) => report.completed += 1,
                    Ok(EntryResult::Quarantined) => report.quarantined += 1,
                    Err(e) => {
                        self.release_unprocessed(pending.collect()).await;
                        return Err(e);
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                workflow = %self.inner.workflow,
                completed = report.completed,
                quarantined = report.quarantined,
                "processed entries"
            );
        }
        Ok(Phase::Ran(report))
    }

    /// Hand claimed entries back to the queue. Failed releases are kept for
    /// the next claim phase.
    async fn release_unprocessed(&self, entries: Vec<QueueEntry>) {
        if entries.is_empty() {
            return;
        }
        match self.inner.store.release(&self.inner.queue, &entries).await {
            Ok(()) => {
                warn!(workflow = %self.inner.workflow, count = entries.len(), "released unprocessed entries");
            }
            Err(e) => {
                error!(
                    workflow = %self.inner.workflow,
                    count = entries.len(),
                    error = %e,
                    "release failed, retrying next claim phase"
                );
                self.unreleased().extend(entries);
            }
        }
    }

    fn unreleased(&self) -> std::sync::MutexGuard<'_, Vec<QueueEntry>> {
        self.inner
            .unreleased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn process_entry(&self, entry: QueueEntry) -> Result<EntryResult> {
        let span = start_entry_span(self.inner.queue.as_str(), entry.id.as_str());

        async {
            let timeout = self.inner.settings.processor_timeout;
            let processor = &self.inner.collaborators.processor;

            let outcome = match tokio::time::timeout(timeout, processor.process(&entry)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Rejection::new(format!(
                    "processor timed out after {}",
                    humantime::format_duration(timeout)
                ))),
            };

            let result = match outcome {
                Ok(()) => {
                    self.inner.store.delete(&self.inner.queue, &entry.id).await?;
                    EntryResult::Completed
                }
                Err(rejection) => {
                    info!(id = %entry.id, reason = %rejection, "rejecting entry");
                    self.inner
                        .store
                        .quarantine(&self.inner.queue, &entry.id, &rejection.reason)
                        .await?;
                    // No-op once the move succeeded.
                    self.inner.store.delete(&self.inner.queue, &entry.id).await?;
                    EntryResult::Quarantined
                }
            };

            record_entry_result(&span, result.as_str());
            metrics::entries_processed().add(
                1,
                &[
                    KeyValue::new("workflow", self.inner.workflow.clone()),
                    KeyValue::new("result", result.as_str()),
                ],
            );
            Ok(result)
        }
        .instrument(span.clone())
        .await
    }

    /// Report quarantined entries once, then remove them.
    ///
    /// Holds the claim guard as well, so alerting and processing of the same
    /// workflow never overlap.
    pub async fn alert(&self) -> Result<Phase<AlertReport>> {
        let Some(_token) = self.inner.guards.alert.try_enter() else {
            debug!(workflow = %self.inner.workflow, "alert already running, skipping");
            return Ok(Phase::Skipped);
        };
        let Some(_claim) = self.inner.guards.claim.try_enter() else {
            debug!(workflow = %self.inner.workflow, "claim running, deferring alerts");
            return Ok(Phase::Skipped);
        };

        let store = &self.inner.store;
        let entries = store
            .list_quarantined(&self.inner.queue, self.inner.settings.report_limit)
            .await?;
        if entries.is_empty() {
            return Ok(Phase::Ran(AlertReport::default()));
        }

        info!(workflow = %self.inner.workflow, count = entries.len(), "found quarantined entries");
        let report = QuarantineReport::new(
            &self.inner.workflow,
            &self.inner.queue,
            store.clock().now(),
            &entries,
        );
        self.inner.collaborators.alerts.deliver(&report).await?;

        let ids: Vec<EntryId> = entries.into_iter().map(|e| e.id).collect();
        store.delete_quarantined(&self.inner.queue, &ids).await?;

        metrics::quarantine_reports()
            .add(1, &[KeyValue::new("workflow", self.inner.workflow.clone())]);
        Ok(Phase::Ran(AlertReport {
            reported: ids.len(),
        }))
    }

    /// Feed the claimed entries to the backpressure monitor.
    pub async fn health_check(&self) -> Result<Health> {
        let claimed = self
            .inner
            .store
            .list_claimed(&self.inner.queue, self.inner.settings.monitor_scan_limit)
            .await?;
        Ok(self.inner.monitor.evaluate(&claimed))
    }
}
