//! Work item store: backend trait plus the `Tracker` facade.
//!
//! Backends implement single round-trip primitives (one bulk write, one scan
//! page, one flag update). The facade layers adaptive batching, retries with
//! an injected backoff policy, and transparent pagination on top, so every
//! backend gets the same failure handling.

pub mod dynamo;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Backend, Config, TrackingSettings};
use crate::error::{Error, Result};
use crate::model::{Flag, GroupKey, ItemRef, Projection, ScanQuery, ScanRow, Stage, WorkItem};
use crate::retry::{BackoffPolicy, retry_transient};
use crate::telemetry::metrics;

pub use dynamo::DynamoStore;
pub use memory::InMemoryStore;

/// One page of scan results.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub rows: Vec<ScanRow>,
    /// Key to resume after. `None` on the last page.
    pub next: Option<ItemRef>,
}

/// Durable storage for work items.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Create the backing table if needed and wait until it accepts writes.
    async fn ensure_table(&self) -> Result<()>;

    /// Write one batch. Returns the items the backend did not accept.
    async fn write_batch(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>>;

    /// Examine up to `limit` records after `start` and return those matching
    /// `query`. A page may be empty while `next` is still set.
    async fn scan_page(
        &self,
        query: &ScanQuery,
        start: Option<ItemRef>,
        limit: usize,
    ) -> Result<ScanPage>;

    /// Set one flag on one record. `Error::NotFound` if the key is absent.
    async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) {}
}

/// Outcome of a bulk [`Tracker::put`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutSummary {
    pub written: usize,
    pub batches: usize,
    pub rejected: usize,
    pub final_batch_size: usize,
}

/// Item counts across the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub total: usize,
    pub groups: usize,
    pub in_progress: usize,
    pub completed: BTreeMap<Stage, usize>,
}

/// Shared handle every component receives at construction.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn WorkItemStore>,
    backoff: Arc<dyn BackoffPolicy>,
    settings: TrackingSettings,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        backoff: Arc<dyn BackoffPolicy>,
        settings: TrackingSettings,
    ) -> Self {
        Self {
            store,
            backoff,
            settings,
        }
    }

    /// Build the backend named by `config` and wrap it.
    pub async fn connect(config: &Config, settings: TrackingSettings) -> Result<Self> {
        settings.validate_for(config.backend)?;
        let store: Arc<dyn WorkItemStore> = match config.backend {
            Backend::Dynamodb => {
                let aws_config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Arc::new(DynamoStore::new(
                    aws_sdk_dynamodb::Client::new(&aws_config),
                    &config.table_name,
                ))
            }
            Backend::Postgres => {
                let url = config.database_url.as_ref().ok_or_else(|| {
                    Error::Config("DATABASE_URL is required for the postgres backend".to_string())
                })?;
                Arc::new(crate::db::Db::connect(url.expose_secret()).await?)
            }
        };
        info!(backend = %config.backend, table = %config.table_name, "tracking store connected");
        let backoff = Arc::new(settings.retry);
        Ok(Self::new(store, backoff, settings))
    }

    pub fn settings(&self) -> &TrackingSettings {
        &self.settings
    }

    pub async fn ensure_table(&self) -> Result<()> {
        self.store.ensure_table().await
    }

    /// Bulk insert with adaptive batch sizing.
    ///
    /// Rejected items go to the back of the queue. When more than half of a
    /// batch is rejected the batch size halves (floor 1). Each batch with
    /// rejections waits per the backoff policy; when the policy gives up the
    /// remaining items are reported in `Error::StoreExhausted`.
    pub async fn put(&self, items: Vec<WorkItem>) -> Result<PutSummary> {
        let mut queue: VecDeque<WorkItem> = items.into();
        let mut batch_size = self.settings.write_batch_size.max(1);
        let mut consecutive_failures = 0u32;
        let mut summary = PutSummary::default();

        while !queue.is_empty() {
            let take = batch_size.min(queue.len());
            let batch: Vec<WorkItem> = queue.drain(..take).collect();
            summary.batches += 1;

            let rejected = match self.store.write_batch(&batch).await {
                Ok(rejected) => rejected,
                Err(e) if e.is_transient() => {
                    warn!(batch_len = batch.len(), error = %e, "batch write throttled");
                    batch.clone()
                }
                Err(e) => {
                    return Err(Error::StoreExhausted {
                        unprocessed: queue.len() + batch.len(),
                        message: e.to_string(),
                    });
                }
            };

            let accepted = batch.len() - rejected.len().min(batch.len());
            summary.written += accepted;
            metrics::items_written().add(accepted as u64, &[]);

            if rejected.is_empty() {
                consecutive_failures = 0;
                continue;
            }

            summary.rejected += rejected.len();
            metrics::write_rejections().add(rejected.len() as u64, &[]);
            if rejected.len() > batch_size / 2 {
                batch_size = (batch_size / 2).max(1);
                debug!(batch_size, "shrinking write batch size");
            }

            consecutive_failures += 1;
            let Some(delay) = self.backoff.next_delay(consecutive_failures) else {
                return Err(Error::StoreExhausted {
                    unprocessed: queue.len() + rejected.len(),
                    message: format!(
                        "{} item(s) still rejected after {} attempt(s)",
                        rejected.len(),
                        consecutive_failures
                    ),
                });
            };
            warn!(
                rejected = rejected.len(),
                attempt = consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "items rejected, requeueing"
            );
            tokio::time::sleep(delay).await;
            queue.extend(rejected);
        }

        summary.final_batch_size = batch_size;
        info!(
            written = summary.written,
            batches = summary.batches,
            rejected = summary.rejected,
            "bulk write complete"
        );
        Ok(summary)
    }

    /// Lazily page through every record matching `query`.
    pub fn pages(&self, query: ScanQuery) -> PageCursor<'_> {
        PageCursor {
            tracker: self,
            query,
            next: None,
            finished: false,
            pages_read: 0,
        }
    }

    /// Every matching row across all pages.
    pub async fn scan(&self, query: ScanQuery) -> Result<Vec<ScanRow>> {
        let mut cursor = self.pages(query);
        let mut rows = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            rows.extend(page);
        }
        debug!(rows = rows.len(), pages = cursor.pages_read(), "scan complete");
        Ok(rows)
    }

    /// Distinct group keys of matching rows, ascending.
    pub async fn groups(&self, query: ScanQuery) -> Result<BTreeSet<GroupKey>> {
        let rows = self.scan(query.project(Projection::GroupKey)).await?;
        Ok(rows.into_iter().map(|row| row.group_key).collect())
    }

    /// Full keys of matching rows, in store order.
    pub async fn item_refs(&self, query: ScanQuery) -> Result<Vec<ItemRef>> {
        let rows = self.scan(query.project(Projection::Keys)).await?;
        Ok(rows.iter().filter_map(ScanRow::item_ref).collect())
    }

    /// Count rows matching `query` without holding them all.
    pub async fn count(&self, query: ScanQuery) -> Result<usize> {
        let mut cursor = self.pages(query.project(Projection::GroupKey));
        let mut total = 0;
        while let Some(page) = cursor.next_page().await? {
            total += page.len();
        }
        Ok(total)
    }

    /// Totals, claimed items, and completions per stage.
    pub async fn status(&self) -> Result<TableStatus> {
        let mut completed = BTreeMap::new();
        for stage in Stage::ALL {
            let done = self
                .count(ScanQuery::all().with(Flag::Stage(stage), true))
                .await?;
            completed.insert(stage, done);
        }
        Ok(TableStatus {
            total: self.count(ScanQuery::all()).await?,
            groups: self.groups(ScanQuery::all()).await?.len(),
            in_progress: self
                .count(ScanQuery::all().with(Flag::InProgress, true))
                .await?,
            completed,
        })
    }

    pub async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()> {
        retry_transient(self.backoff.as_ref(), "set_flag", || {
            self.store.set_flag(key, flag, value)
        })
        .await?;
        metrics::flag_updates().add(
            1,
            &[
                KeyValue::new("flag", flag.to_string()),
                KeyValue::new("value", value),
            ],
        );
        debug!(item = %key, %flag, value, "flag updated");
        Ok(())
    }

    /// Clear `in_progress` on items left claimed by a crashed worker,
    /// optionally within one group. Returns how many claims were cleared.
    pub async fn reset_claims(&self, group: Option<GroupKey>) -> Result<usize> {
        let mut query = ScanQuery::all().with(Flag::InProgress, true);
        if let Some(group) = group {
            query = query.in_group(group);
        }
        let mut cleared = 0;
        for item in self.item_refs(query).await? {
            match self.set_flag(&item, Flag::InProgress, false).await {
                Ok(()) => cleared += 1,
                Err(Error::NotFound(key)) => warn!(item = %key, "item vanished during reset"),
                Err(e) => return Err(e),
            }
        }
        info!(cleared, group = ?group.map(|g| g.0), "stuck claims reset");
        Ok(cleared)
    }

    /// Release the backend at process end.
    pub async fn close(self) {
        self.store.close().await;
    }
}

/// Lazy sequence of scan pages. Drop it to stop early.
pub struct PageCursor<'a> {
    tracker: &'a Tracker,
    query: ScanQuery,
    next: Option<ItemRef>,
    finished: bool,
    pages_read: usize,
}

impl PageCursor<'_> {
    /// Fetch the next page, or `None` once the store reports no more.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ScanRow>>> {
        if self.finished {
            return Ok(None);
        }

        let start = self.next.clone();
        let limit = self.tracker.settings.page_size.max(1);
        let page = retry_transient(self.tracker.backoff.as_ref(), "scan_page", || {
            self.tracker.store.scan_page(&self.query, start.clone(), limit)
        })
        .await?;

        self.pages_read += 1;
        metrics::scan_pages().add(1, &[]);
        self.finished = page.next.is_none();
        self.next = page.next;
        Ok(Some(page.rows))
    }

    pub fn pages_read(&self) -> usize {
        self.pages_read
    }
}
