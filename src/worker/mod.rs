//! Worker side of the claim protocol.
//!
//! A worker is started with one group. It enumerates the group's items and,
//! per item, claims it (`in_progress = true`), runs the stage, and on success
//! sets the stage flag before releasing the claim. A failed stage releases
//! the claim only, so the item stays eligible for the next dispatch.
//!
//! Claims are plain writes. Two workers given the same group can both claim
//! an item, and a worker killed mid-item leaves `in_progress` set until an
//! operator runs [`Tracker::reset_claims`].

pub mod runner;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{Instrument, Span, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    ClaimState, Flag, GroupKey, ItemRef, ScanQuery, Selection, Stage, eligible_item_query,
};
use crate::store::Tracker;
use crate::telemetry::{metrics, work};

pub use runner::{CommandRunner, StageRunner};

/// How one item's claim ended.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub item: ItemRef,
    pub state: ClaimState,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a worker run over one group.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub run_id: Uuid,
    pub group: GroupKey,
    pub stage: Stage,
    pub selection: Selection,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemOutcome>,
    /// Items that vanished from the store between enumeration and claim.
    pub skipped: Vec<ItemRef>,
}

impl WorkerReport {
    pub fn done(&self) -> usize {
        self.count(ClaimState::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(ClaimState::Failed)
    }

    fn count(&self, state: ClaimState) -> usize {
        self.items.iter().filter(|o| o.state == state).count()
    }
}

pub struct Worker {
    tracker: Tracker,
    runner: Arc<dyn StageRunner>,
}

impl Worker {
    pub fn new(tracker: Tracker, runner: Arc<dyn StageRunner>) -> Self {
        Self { tracker, runner }
    }

    /// Items of `group` this worker should process, in store order.
    pub async fn items(
        &self,
        group: GroupKey,
        stage: Stage,
        selection: Selection,
    ) -> Result<Vec<ItemRef>> {
        let query = match selection {
            Selection::All => ScanQuery::all(),
            Selection::Eligible => eligible_item_query(
                stage,
                self.tracker.settings().ready_excludes_in_progress,
            ),
        };
        self.tracker.item_refs(query.in_group(group)).await
    }

    /// Run the claim protocol over every selected item of `group`.
    ///
    /// A missing item is skipped; a failed stage is recorded and the run
    /// moves on; any other store error aborts the run.
    pub async fn run_group(
        &self,
        group: GroupKey,
        stage: Stage,
        selection: Selection,
    ) -> Result<WorkerReport> {
        let run_id = Uuid::new_v4();
        let span = work::start_group_span("work", group, stage, &run_id);
        async {
            let started_at = Utc::now();
            let items = self.items(group, stage, selection).await?;
            info!(items = items.len(), ?selection, "worker starting");

            let mut outcomes = Vec::with_capacity(items.len());
            let mut skipped = Vec::new();
            for item in items {
                match self.process_item(&item, stage).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(Error::NotFound(key)) => {
                        warn!(item = %key, "item no longer in store, skipping");
                        skipped.push(item);
                    }
                    Err(e) => {
                        error!(%item, error = %e, "store failure, aborting worker run");
                        return Err(e);
                    }
                }
            }

            let report = WorkerReport {
                run_id,
                group,
                stage,
                selection,
                started_at,
                finished_at: Utc::now(),
                items: outcomes,
                skipped,
            };
            info!(
                done = report.done(),
                failed = report.failed(),
                skipped = report.skipped.len(),
                "worker finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Claim, run and release one item.
    ///
    /// Returns `Ok` with a `Done` or `Failed` outcome once the claim has been
    /// released. Store errors propagate; a failed stage-flag write still
    /// releases the claim before its error is returned.
    pub async fn process_item(&self, item: &ItemRef, stage: Stage) -> Result<ItemOutcome> {
        let span = work::start_item_span(&item.item_key, stage);
        let mut state = ClaimState::Idle;

        self.tracker.set_flag(item, Flag::InProgress, true).await?;
        advance(&span, &mut state, ClaimState::Claimed)?;

        let started = Instant::now();
        let result = self
            .runner
            .run(item, stage)
            .instrument(span.clone())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(()) => {
                if let Err(e) = self.tracker.set_flag(item, Flag::Stage(stage), true).await {
                    // Release the claim so the item stays eligible.
                    match self.tracker.set_flag(item, Flag::InProgress, false).await {
                        Ok(()) => advance(&span, &mut state, ClaimState::Failed)?,
                        Err(release) => span.in_scope(|| {
                            error!(error = %release, "claim release failed, item stays claimed")
                        }),
                    }
                    return Err(e);
                }
                self.tracker.set_flag(item, Flag::InProgress, false).await?;
                advance(&span, &mut state, ClaimState::Done)?;
                None
            }
            Err(e) => {
                span.in_scope(|| warn!(error = %e, duration_ms, "stage failed, releasing claim"));
                self.tracker.set_flag(item, Flag::InProgress, false).await?;
                advance(&span, &mut state, ClaimState::Failed)?;
                Some(e.to_string())
            }
        };

        metrics::stage_duration_ms().record(
            duration_ms as f64,
            &[
                KeyValue::new("stage", stage.as_str()),
                KeyValue::new("result", if error.is_none() { "ok" } else { "error" }),
            ],
        );

        Ok(ItemOutcome {
            item: item.clone(),
            state,
            duration_ms,
            error,
        })
    }
}

fn advance(span: &Span, state: &mut ClaimState, to: ClaimState) -> Result<()> {
    if !state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: state.to_string(),
            to: to.to_string(),
        });
    }
    work::record_claim_transition(span, *state, to);
    metrics::claim_transitions().add(
        1,
        &[
            KeyValue::new("from", state.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
    *state = to;
    Ok(())
}
