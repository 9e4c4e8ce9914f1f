//! Tracker behaviour over the in-memory store and scripted failing stores.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use batchtrack::config::{Backend, Config, TrackingSettings};
use batchtrack::error::{Error, Result};
use batchtrack::model::{Flag, GroupKey, ItemRef, ScanQuery, Stage, WorkItem};
use batchtrack::retry::ImmediateRetry;
use batchtrack::store::{InMemoryStore, ScanPage, Tracker, WorkItemStore};

/// Accepts a scripted number of items per bulk write and rejects the rest.
struct Throttled {
    inner: InMemoryStore,
    accept: Mutex<VecDeque<usize>>,
    fallback: usize,
    batch_sizes: Mutex<Vec<usize>>,
    flag_failures: Mutex<u32>,
}

impl Throttled {
    fn new(script: &[usize], fallback: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            accept: Mutex::new(script.iter().copied().collect()),
            fallback,
            batch_sizes: Mutex::new(Vec::new()),
            flag_failures: Mutex::new(0),
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkItemStore for Throttled {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        self.batch_sizes.lock().unwrap().push(items.len());
        let accept = self
            .accept
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
            .min(items.len());
        self.inner.write_batch(&items[..accept]).await?;
        Ok(items[accept..].to_vec())
    }

    async fn scan_page(
        &self,
        query: &ScanQuery,
        start: Option<ItemRef>,
        limit: usize,
    ) -> Result<ScanPage> {
        self.inner.scan_page(query, start, limit).await
    }

    async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()> {
        {
            let mut failures = self.flag_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::TransientStore("ProvisionedThroughputExceeded".to_string()));
            }
        }
        self.inner.set_flag(key, flag, value).await
    }
}

fn settings(write_batch_size: usize, page_size: usize) -> TrackingSettings {
    TrackingSettings {
        write_batch_size,
        page_size,
        ..TrackingSettings::default()
    }
}

fn tracker(store: Arc<dyn WorkItemStore>, settings: TrackingSettings, retries: u32) -> Tracker {
    Tracker::new(
        store,
        Arc::new(ImmediateRetry {
            max_retries: retries,
        }),
        settings,
    )
}

fn items(n: usize, group_size: usize) -> Vec<WorkItem> {
    (0..n)
        .map(|i| WorkItem::new(GroupKey((i / group_size) as u32), format!("item_{i:03}")))
        .collect()
}

#[tokio::test]
async fn put_requeues_rejected_items_and_halves_batch() {
    let store = Arc::new(Throttled::new(&[1], usize::MAX));
    let tracker = tracker(store.clone(), settings(4, 100), 5);

    let summary = tracker.put(items(10, 5)).await.unwrap();

    assert_eq!(summary.written, 10);
    assert_eq!(summary.rejected, 3);
    assert_eq!(summary.final_batch_size, 2);
    assert_eq!(store.batch_sizes(), vec![4, 2, 2, 2, 2, 1]);
    assert_eq!(store.inner.len(), 10);
}

#[tokio::test]
async fn put_keeps_batch_size_when_half_or_less_rejected() {
    let store = Arc::new(Throttled::new(&[2], usize::MAX));
    let tracker = tracker(store.clone(), settings(4, 100), 5);

    let summary = tracker.put(items(8, 4)).await.unwrap();

    assert_eq!(summary.final_batch_size, 4);
    assert_eq!(store.batch_sizes(), vec![4, 4, 2]);
    assert_eq!(store.inner.len(), 8);
}

#[tokio::test]
async fn put_shrinks_to_one_and_no_further() {
    let store = Arc::new(Throttled::new(&[0, 0, 0], usize::MAX));
    let tracker = tracker(store.clone(), settings(4, 100), 10);

    let summary = tracker.put(items(4, 4)).await.unwrap();

    assert_eq!(store.batch_sizes(), vec![4, 2, 1, 1, 1, 1, 1]);
    assert_eq!(summary.final_batch_size, 1);
    assert_eq!(summary.written, 4);
    assert_eq!(summary.rejected, 7);
}

#[tokio::test]
async fn put_surfaces_unprocessed_items_when_backoff_gives_up() {
    let store = Arc::new(Throttled::new(&[], 0));
    let tracker = tracker(store.clone(), settings(25, 100), 2);

    let err = tracker.put(items(3, 3)).await.unwrap_err();

    match err {
        Error::StoreExhausted { unprocessed, .. } => assert_eq!(unprocessed, 3),
        other => panic!("expected StoreExhausted, got {other:?}"),
    }
    assert_eq!(store.batch_sizes().len(), 3);
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn scan_returns_every_match_across_pages() {
    let store = Arc::new(InMemoryStore::with_items(items(10, 4)));
    let tracker = tracker(store, settings(25, 3), 0);

    let refs = tracker.item_refs(ScanQuery::all()).await.unwrap();
    let unique: HashSet<_> = refs.iter().cloned().collect();
    assert_eq!(refs.len(), 10);
    assert_eq!(unique.len(), 10);

    let mut cursor = tracker.pages(ScanQuery::all());
    while cursor.next_page().await.unwrap().is_some() {}
    assert_eq!(cursor.pages_read(), 4);
}

#[tokio::test]
async fn group_filter_holds_across_pages() {
    let store = Arc::new(InMemoryStore::with_items(items(10, 4)));
    let tracker = tracker(store, settings(25, 3), 0);

    let refs = tracker
        .item_refs(ScanQuery::all().in_group(GroupKey(1)))
        .await
        .unwrap();
    let keys: Vec<_> = refs.iter().map(|r| r.item_key.as_str()).collect();
    assert_eq!(keys, vec!["item_004", "item_005", "item_006", "item_007"]);
    assert!(refs.iter().all(|r| r.group_key == GroupKey(1)));
}

#[tokio::test]
async fn flag_filter_applies_to_every_page() {
    let mut seeded = items(9, 3);
    for item in seeded.iter_mut().step_by(2) {
        item.stages.segmented = true;
    }
    let store = Arc::new(InMemoryStore::with_items(seeded));
    let tracker = tracker(store, settings(25, 2), 0);

    let done = tracker
        .item_refs(ScanQuery::all().with(Flag::Stage(Stage::Segmented), true))
        .await
        .unwrap();
    assert_eq!(done.len(), 5);
    let groups = tracker.groups(ScanQuery::all()).await.unwrap();
    assert_eq!(groups.into_iter().map(|g| g.0).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[tokio::test]
async fn cursor_fetches_lazily() {
    let store = Arc::new(InMemoryStore::with_items(items(10, 4)));
    let tracker = tracker(store, settings(25, 3), 0);

    let mut cursor = tracker.pages(ScanQuery::all());
    let first = cursor.next_page().await.unwrap().unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(cursor.pages_read(), 1);
}

#[tokio::test]
async fn set_flag_on_missing_key_is_not_found() {
    let store = Arc::new(InMemoryStore::with_items(items(2, 2)));
    let tracker = tracker(store.clone(), settings(25, 100), 3);

    let missing = ItemRef::new(GroupKey(7), "ghost");
    let err = tracker
        .set_flag(&missing, Flag::InProgress, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(store.get(&missing).is_none());
}

#[tokio::test]
async fn set_flag_retries_transient_failures() {
    let store = Arc::new(Throttled::new(&[], usize::MAX));
    let tracker = tracker(store.clone(), settings(25, 100), 3);
    tracker.put(items(1, 1)).await.unwrap();
    *store.flag_failures.lock().unwrap() = 2;

    let key = ItemRef::new(GroupKey(0), "item_000");
    tracker
        .set_flag(&key, Flag::Stage(Stage::Segmented), true)
        .await
        .unwrap();
    assert!(store.inner.get(&key).unwrap().stages.segmented);
}

#[tokio::test]
async fn status_counts_flags() {
    let mut seeded = items(5, 2);
    seeded[0].stages.segmented = true;
    seeded[1].stages.segmented = true;
    seeded[1].stages.parcellated = true;
    seeded[4].in_progress = true;
    let store = Arc::new(InMemoryStore::with_items(seeded));
    let tracker = tracker(store, settings(25, 2), 0);

    let status = tracker.status().await.unwrap();
    assert_eq!(status.total, 5);
    assert_eq!(status.groups, 3);
    assert_eq!(status.in_progress, 1);
    assert_eq!(status.completed[&Stage::Segmented], 2);
    assert_eq!(status.completed[&Stage::Parcellated], 1);
}

#[tokio::test]
async fn reset_claims_clears_only_stuck_items() {
    let mut seeded = items(4, 2);
    seeded[0].in_progress = true;
    seeded[1].stages.segmented = true;
    seeded[2].in_progress = true;
    let store = Arc::new(InMemoryStore::with_items(seeded));
    let tracker = tracker(store.clone(), settings(25, 1), 0);

    let stored = |group, key| store.get(&ItemRef::new(GroupKey(group), key)).unwrap();

    assert_eq!(tracker.reset_claims(Some(GroupKey(0))).await.unwrap(), 1);
    assert!(!stored(0, "item_000").in_progress);
    assert!(stored(1, "item_002").in_progress);
    assert!(stored(0, "item_001").stages.segmented);

    assert_eq!(tracker.reset_claims(None).await.unwrap(), 1);
    assert!(store.snapshot().iter().all(|i| !i.in_progress));
    assert_eq!(tracker.reset_claims(None).await.unwrap(), 0);
}

#[tokio::test]
async fn connect_rejects_oversized_dynamodb_batches() {
    let config = Config {
        backend: Backend::Dynamodb,
        table_name: "tracking".to_string(),
        database_url: None,
        otel_endpoint: None,
        log_level: "info".to_string(),
    };
    let result = Tracker::connect(&config, settings(26, 100)).await;
    assert!(matches!(result, Err(Error::Config(_))));
}
