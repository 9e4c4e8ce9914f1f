//! Group and item span helpers.
//!
//! Worker and dispatcher runs open one span per group; each item gets a
//! child span whose `claim.state` field tracks the claim protocol.

use tracing::Span;
use uuid::Uuid;

use crate::model::{ClaimState, GroupKey, Stage};

/// Start a span covering one worker or dispatch run over a group.
pub fn start_group_span(operation: &str, group: GroupKey, stage: Stage, run_id: &Uuid) -> Span {
    tracing::info_span!(
        "batch.group",
        "batch.operation" = operation,
        "batch.group" = group.0,
        "batch.stage" = %stage,
        "batch.run_id" = %run_id,
    )
}

/// Start a span for one item's claim lifecycle.
///
/// The `claim.state` field is declared empty and updated via
/// [`record_claim_transition`].
pub fn start_item_span(item_key: &str, stage: Stage) -> Span {
    tracing::info_span!(
        "batch.item",
        "item.key" = item_key,
        "batch.stage" = %stage,
        "claim.state" = tracing::field::Empty,
    )
}

/// Record a claim transition on the given span.
pub fn record_claim_transition(span: &Span, from: ClaimState, to: ClaimState) {
    span.record("claim.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "claim_transition");
    });
}
