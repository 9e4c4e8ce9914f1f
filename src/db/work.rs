//! Work item operations on Postgres: bulk upsert, keyset-paged scans, flag updates.

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::error::{Error, Result};
use crate::model::{Flag, GroupKey, ItemRef, Projection, ScanQuery, ScanRow, Stage, WorkItem};
use crate::store::{ScanPage, WorkItemStore};

/// Column backing a flag. Only ever interpolated from this closed set.
fn flag_column(flag: Flag) -> &'static str {
    match flag {
        Flag::InProgress => "in_progress",
        Flag::Stage(Stage::Segmented) => "segmented",
        Flag::Stage(Stage::Parcellated) => "parcellated",
    }
}

#[async_trait]
impl WorkItemStore for super::Db {
    async fn ensure_table(&self) -> Result<()> {
        self.migrate().await
    }

    /// Upsert one batch. Postgres either takes the whole batch or fails it,
    /// so nothing is ever returned as unprocessed.
    async fn write_batch(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO work_items (group_key, item_key, in_progress, segmented, parcellated) ",
        );
        builder.push_values(items, |mut row, item| {
            row.push_bind(i64::from(item.group_key.0))
                .push_bind(item.item_key.clone())
                .push_bind(item.in_progress)
                .push_bind(item.stages.segmented)
                .push_bind(item.stages.parcellated);
        });
        builder.push(
            " ON CONFLICT (group_key, item_key) DO UPDATE SET
                in_progress = EXCLUDED.in_progress,
                segmented = EXCLUDED.segmented,
                parcellated = EXCLUDED.parcellated",
        );
        builder.build().execute(&self.pool).await?;
        Ok(Vec::new())
    }

    async fn scan_page(
        &self,
        query: &ScanQuery,
        start: Option<ItemRef>,
        limit: usize,
    ) -> Result<ScanPage> {
        let limit = limit.max(1);
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT group_key, item_key FROM work_items WHERE TRUE");
        if let Some(group) = query.group {
            builder
                .push(" AND group_key = ")
                .push_bind(i64::from(group.0));
        }
        for &(flag, value) in &query.conditions {
            builder
                .push(format!(" AND {} = ", flag_column(flag)))
                .push_bind(value);
        }
        if let Some(start) = start {
            builder
                .push(" AND (group_key, item_key) > (")
                .push_bind(i64::from(start.group_key.0))
                .push(", ")
                .push_bind(start.item_key)
                .push(")");
        }
        builder
            .push(" ORDER BY group_key, item_key LIMIT ")
            .push_bind(limit as i64);

        let records = builder.build().fetch_all(&self.pool).await?;

        let mut keys = Vec::with_capacity(records.len());
        for record in &records {
            let group: i64 = record.try_get("group_key")?;
            let group = u32::try_from(group)
                .map_err(|_| Error::Other(format!("group_key {group} out of range")))?;
            let item_key: String = record.try_get("item_key")?;
            keys.push(ItemRef::new(GroupKey(group), item_key));
        }

        let next = if keys.len() == limit {
            keys.last().cloned()
        } else {
            None
        };
        let rows = keys
            .into_iter()
            .map(|key| ScanRow {
                group_key: key.group_key,
                item_key: match query.projection {
                    Projection::Keys => Some(key.item_key),
                    Projection::GroupKey => None,
                },
            })
            .collect();

        Ok(ScanPage { rows, next })
    }

    async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()> {
        let sql = format!(
            "UPDATE work_items SET {} = $1 WHERE group_key = $2 AND item_key = $3",
            flag_column(flag)
        );
        let rows_affected = sqlx::query(&sql)
            .bind(value)
            .bind(i64::from(key.group_key.0))
            .bind(&key.item_key)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
