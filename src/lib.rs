//! # batchtrack
//!
//! Job tracking for batched processing pipelines.
//!
//! A tracking table holds one record per work item, grouped into fixed-size
//! batches. The indexer populates it, the dispatcher submits one job per
//! group that still has work, and each job runs a worker that claims, runs
//! and releases the items of its group.
//!
//! The table lives in DynamoDB or Postgres (sqlx) behind the
//! [`store::WorkItemStore`] trait, with an in-memory store for library use
//! and tests; jobs go to AWS Batch behind [`dispatch::JobSubmitter`].

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod indexer;
pub mod model;
pub mod retry;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;
