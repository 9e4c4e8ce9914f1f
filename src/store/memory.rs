//! In-process store for tests and dry runs.
//!
//! Pages are cut the way DynamoDB cuts them: `limit` bounds the records
//! examined, not the records returned, so filtered pages can come back
//! short or empty with a continuation key.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ScanPage, WorkItemStore};
use crate::error::{Error, Result};
use crate::model::{Flag, GroupKey, ItemRef, ScanQuery, WorkItem};

type Key = (GroupKey, String);

#[derive(Debug, Default)]
pub struct InMemoryStore {
    items: Mutex<BTreeMap<Key, WorkItem>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store directly, bypassing batching.
    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for item in items {
                map.insert((item.group_key, item.item_key.clone()), item);
            }
        }
        store
    }

    /// Snapshot of one record.
    pub fn get(&self, key: &ItemRef) -> Option<WorkItem> {
        self.lock()
            .get(&(key.group_key, key.item_key.clone()))
            .cloned()
    }

    /// Snapshot of every record in key order.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, WorkItem>> {
        // A poisoned map is still structurally valid; every mutation is a
        // single insert or field write.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WorkItemStore for InMemoryStore {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn write_batch(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        let mut map = self.lock();
        for item in items {
            map.insert((item.group_key, item.item_key.clone()), item.clone());
        }
        Ok(Vec::new())
    }

    async fn scan_page(
        &self,
        query: &ScanQuery,
        start: Option<ItemRef>,
        limit: usize,
    ) -> Result<ScanPage> {
        let map = self.lock();
        let lower = match start {
            Some(key) => Bound::Excluded((key.group_key, key.item_key)),
            None => Bound::Unbounded,
        };

        let mut examined = map.range((lower, Bound::Unbounded)).peekable();
        let mut rows = Vec::new();
        let mut last = None;
        let mut count = 0;
        while count < limit.max(1) {
            let Some((key, item)) = examined.next() else {
                break;
            };
            count += 1;
            if query.matches(item) {
                rows.push(query.row(item));
            }
            last = Some(key.clone());
        }

        let next = match (examined.peek(), last) {
            (Some(_), Some((group_key, item_key))) => Some(ItemRef::new(group_key, item_key)),
            _ => None,
        };
        Ok(ScanPage { rows, next })
    }

    async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()> {
        let mut map = self.lock();
        let item = map
            .get_mut(&(key.group_key, key.item_key.clone()))
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        item.set_flag(flag, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;

    fn items(n: u32) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(GroupKey(i / 2), format!("S_{i:02}")))
            .collect()
    }

    #[tokio::test]
    async fn filtered_page_can_be_empty_with_continuation() {
        let store = InMemoryStore::with_items(items(6));
        let query = ScanQuery::all().in_group(GroupKey(2));

        let first = store.scan_page(&query, None, 2).await.unwrap();
        assert!(first.rows.is_empty());
        assert!(first.next.is_some());
    }

    #[tokio::test]
    async fn last_page_has_no_continuation() {
        let store = InMemoryStore::with_items(items(4));
        let page = store.scan_page(&ScanQuery::all(), None, 4).await.unwrap();
        assert_eq!(page.rows.len(), 4);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn set_flag_on_missing_key_is_not_found() {
        let store = InMemoryStore::with_items(items(2));
        let err = store
            .set_flag(
                &ItemRef::new(GroupKey(9), "nope"),
                Flag::Stage(Stage::Segmented),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
