mod pipeline;

pub(crate) use pipeline::{run_pipeline, GradingRequest};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::config::Settings;
use crate::domain::types::{FailureReason, GradingStatus};
use crate::domain::{BatchResult, GradingResult, PipelineError, Rubric, Submission};
use crate::services::ai_grading::GradingClient;

/// Drives the grading client across a batch with a bounded worker pool.
pub(crate) struct GradingOrchestrator {
    client: GradingClient,
    max_concurrency: usize,
    batch_timeout: Option<Duration>,
}

impl GradingOrchestrator {
    pub(crate) fn new(client: GradingClient, max_concurrency: usize, batch_timeout: Option<Duration>) -> Self {
        Self { client, max_concurrency: max_concurrency.max(1), batch_timeout }
    }

    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            GradingClient::from_settings(settings)?,
            settings.grading().max_concurrency,
            settings.grading().batch_timeout(),
        ))
    }

    /// Grades every submission. The result has one entry per submission, in input order.
    ///
    /// Once `cancel` flips to `true` or the batch timeout elapses, no further submissions are
    /// dispatched; calls already running are awaited and the rest are marked cancelled.
    pub(crate) async fn grade_batch(
        &self,
        rubric: Arc<Rubric>,
        submissions: Vec<Submission>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<BatchResult, PipelineError> {
        if submissions.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }

        let started = Instant::now();
        let deadline = self.batch_timeout.map(|timeout| started + timeout);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let total = submissions.len();

        tracing::info!(
            submissions = total,
            max_concurrency = self.max_concurrency,
            max_score = rubric.max_score(),
            "Grading batch started"
        );

        let mut slots: Vec<Option<GradingResult>> = vec![None; total];
        let mut handles: Vec<(usize, Submission, JoinHandle<GradingResult>)> = Vec::with_capacity(total);
        let mut pending = submissions.into_iter().enumerate();

        for (index, submission) in pending.by_ref() {
            let permit = if *cancel.borrow() {
                None
            } else {
                // Cancellation and the deadline win over a free permit.
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => None,
                    _ = deadline_reached(deadline) => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };

            let Some(permit) = permit else {
                tracing::warn!(dispatched = index, submissions = total, "Grading batch cancelled");
                slots[index] = Some(GradingResult::failed(&submission, FailureReason::Cancelled, 0));
                break;
            };

            let client = self.client.clone();
            let rubric = Arc::clone(&rubric);
            let task_submission = submission.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                client.grade(&rubric, &task_submission).await
            });
            handles.push((index, submission, handle));
        }

        for (index, submission) in pending {
            slots[index] = Some(GradingResult::failed(&submission, FailureReason::Cancelled, 0));
        }

        for (index, submission, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(
                        submission = %submission.student_identifier,
                        error = %err,
                        "Grading task aborted"
                    );
                    GradingResult::failed(
                        &submission,
                        FailureReason::TransportError("grading task aborted".to_string()),
                        0,
                    )
                }
            };
            slots[index] = Some(result);
        }

        let results: Vec<GradingResult> = slots.into_iter().flatten().collect();
        debug_assert_eq!(results.len(), total);
        for result in &results {
            if let GradingStatus::Failed(reason) = &result.status {
                metrics::counter!("grading_failures_total", "reason" => reason.as_metric_label()).increment(1);
            }
        }

        let batch = BatchResult::new(results, started.elapsed(), rubric.max_score());
        metrics::histogram!("grading_batch_duration_seconds").record(batch.elapsed.as_secs_f64());
        tracing::info!(
            submissions = batch.total,
            succeeded = batch.succeeded,
            failed = batch.failed,
            elapsed_ms = batch.elapsed.as_millis() as u64,
            "Grading batch finished"
        );

        Ok(batch)
    }
}

/// Resolves once the signal reads `true`. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
