//! Dispatcher: finds groups that still have work and submits one job each.
//!
//! Submission failures are isolated per group. The report lists what was
//! submitted and what failed; re-running the dispatcher picks up any group
//! whose job never started because its items are still eligible.

pub mod batch;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::error::Result;
use crate::model::{Flag, GroupKey, ScanQuery, Selection, Stage, eligible_item_query};
use crate::store::Tracker;
use crate::telemetry::metrics;

pub use batch::AwsBatchSubmitter;

/// The single environment parameter a job receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobParameter {
    pub name: String,
    pub value: String,
}

/// Everything the execution service needs to start one group's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub job_name: String,
    pub job_definition: String,
    pub job_queue: String,
    pub parameter: JobParameter,
}

/// External job-execution service.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submit one job and return its id.
    async fn submit(&self, request: &JobRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedJob {
    pub group: GroupKey,
    pub job_name: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSubmission {
    pub group: GroupKey,
    pub error: String,
}

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub run_id: Uuid,
    pub stage: Stage,
    pub selection: Selection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub eligible: usize,
    pub submitted: Vec<SubmittedJob>,
    pub failed: Vec<FailedSubmission>,
    /// Eligible groups left for a later run by `max_jobs`.
    pub deferred: Vec<GroupKey>,
}

impl DispatchReport {
    pub fn failed_groups(&self) -> Vec<GroupKey> {
        self.failed.iter().map(|f| f.group).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }
}

pub struct Dispatcher {
    tracker: Tracker,
    submitter: Arc<dyn JobSubmitter>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        tracker: Tracker,
        submitter: Arc<dyn JobSubmitter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            tracker,
            submitter,
            settings,
        }
    }

    /// Groups to run `stage` for, ascending and distinct.
    ///
    /// `Eligible` for a stage without a prerequisite: groups with at least
    /// one unclaimed item missing the stage. For a stage with a
    /// prerequisite: additionally every item of the group must already have
    /// the prerequisite. `All`: every group in the table.
    pub async fn eligible_groups(
        &self,
        stage: Stage,
        selection: Selection,
    ) -> Result<Vec<GroupKey>> {
        let groups = match selection {
            Selection::All => self.tracker.groups(ScanQuery::all()).await?,
            Selection::Eligible => {
                let exclude = self.tracker.settings().ready_excludes_in_progress;
                let candidates = self
                    .tracker
                    .groups(eligible_item_query(stage, exclude))
                    .await?;
                match stage.prerequisite() {
                    None => candidates,
                    Some(prerequisite) => {
                        let blocked = self
                            .tracker
                            .groups(ScanQuery::all().with(Flag::Stage(prerequisite), false))
                            .await?;
                        candidates.difference(&blocked).copied().collect::<BTreeSet<_>>()
                    }
                }
            }
        };
        Ok(groups.into_iter().collect())
    }

    /// The job request for one group.
    pub fn job_request(&self, group: GroupKey) -> JobRequest {
        JobRequest {
            job_name: format!("{}-{}", self.settings.job_name_prefix, group),
            job_definition: self.settings.job_definition.clone(),
            job_queue: self.settings.job_queue.clone(),
            parameter: JobParameter {
                name: self.settings.group_env_var.clone(),
                value: group.to_string(),
            },
        }
    }

    /// Submit one job per eligible group, in ascending group order.
    pub async fn dispatch(&self, stage: Stage, selection: Selection) -> Result<DispatchReport> {
        self.settings.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("batch.dispatch", "batch.run_id" = %run_id, "batch.stage" = %stage);
        async {
            let started_at = Utc::now();
            let mut groups = self.eligible_groups(stage, selection).await?;
            let eligible = groups.len();
            let deferred = match self.settings.max_jobs {
                Some(max) if max < groups.len() => groups.split_off(max),
                _ => Vec::new(),
            };
            info!(
                eligible,
                submitting = groups.len(),
                deferred = deferred.len(),
                ?selection,
                "dispatching groups"
            );

            let mut submitted = Vec::new();
            let mut failed = Vec::new();
            for group in groups {
                let request = self.job_request(group);
                match self.submitter.submit(&request).await {
                    Ok(job_id) => {
                        info!(%group, job_name = %request.job_name, %job_id, "job submitted");
                        metrics::jobs_submitted().add(
                            1,
                            &[
                                KeyValue::new("stage", stage.as_str()),
                                KeyValue::new("result", "ok"),
                            ],
                        );
                        submitted.push(SubmittedJob {
                            group,
                            job_name: request.job_name,
                            job_id,
                        });
                    }
                    Err(e) => {
                        error!(%group, error = %e, "job submission failed, continuing");
                        metrics::jobs_submitted().add(
                            1,
                            &[
                                KeyValue::new("stage", stage.as_str()),
                                KeyValue::new("result", "error"),
                            ],
                        );
                        failed.push(FailedSubmission {
                            group,
                            error: e.to_string(),
                        });
                    }
                }
            }

            let report = DispatchReport {
                run_id,
                stage,
                selection,
                started_at,
                finished_at: Utc::now(),
                eligible,
                submitted,
                failed,
                deferred,
            };
            info!(
                submitted = report.submitted.len(),
                failed = report.failed.len(),
                "dispatch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}
