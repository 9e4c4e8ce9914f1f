//! Group assignment for a fresh tracking table.
//!
//! Item keys are sorted and de-duplicated before chunking, so the same
//! listing always produces the same groups no matter what order the
//! source returned it in.

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{GroupKey, WorkItem};

/// Splits an item listing into fixed-size groups.
#[derive(Debug, Clone, Copy)]
pub struct BatchIndexer {
    group_size: usize,
}

/// Shape of an indexing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupPlan {
    pub items: usize,
    pub duplicates_dropped: usize,
    pub group_sizes: Vec<usize>,
}

impl GroupPlan {
    pub fn group_count(&self) -> usize {
        self.group_sizes.len()
    }
}

impl BatchIndexer {
    pub fn new(group_size: usize) -> Result<Self> {
        if group_size == 0 {
            return Err(Error::Config("group size must be at least 1".to_string()));
        }
        Ok(Self { group_size })
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Build unclaimed, unprocessed work items with groups assigned.
    pub fn index<I, S>(&self, item_keys: I) -> Result<(Vec<WorkItem>, GroupPlan)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = item_keys.into_iter().map(Into::into).collect();
        let received = keys.len();
        keys.sort();
        keys.dedup();

        let mut items = Vec::with_capacity(keys.len());
        let mut group_sizes = Vec::with_capacity(keys.len().div_ceil(self.group_size));
        for (index, chunk) in keys.chunks(self.group_size).enumerate() {
            let group = GroupKey(u32::try_from(index).map_err(|_| {
                Error::Config(format!("too many groups for group size {}", self.group_size))
            })?);
            group_sizes.push(chunk.len());
            items.extend(chunk.iter().map(|key| WorkItem::new(group, key.clone())));
        }

        let plan = GroupPlan {
            items: items.len(),
            duplicates_dropped: received - items.len(),
            group_sizes,
        };
        info!(
            items = plan.items,
            groups = plan.group_count(),
            group_size = self.group_size,
            duplicates_dropped = plan.duplicates_dropped,
            "work items indexed"
        );
        Ok((items, plan))
    }
}
