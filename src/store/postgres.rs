//! Postgres-backed scan store shared by cooperating processes.
//!
//! The claim is one `UPDATE ... WHERE hash = (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement, so concurrent claimants never observe the same leaf as free.

use super::{ScanFilter, ScanStore};
use crate::range::{NodeHash, ParentRef, RangeNode, RangeNodeParts};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scan_nodes (
        hash TEXT PRIMARY KEY,
        start_block BIGINT NOT NULL,
        end_block BIGINT NOT NULL,
        scan_key TEXT NOT NULL,
        tree_depth INTEGER NOT NULL,
        is_leaf_node BOOLEAN NOT NULL,
        processed_block BIGINT,
        parent_start BIGINT,
        parent_end BIGINT,
        parent_scan_key TEXT,
        parent_tree_depth INTEGER,
        "timestamp" TIMESTAMPTZ NOT NULL,
        start_timestamp TIMESTAMPTZ,
        end_timestamp TIMESTAMPTZ,
        CONSTRAINT scan_nodes_range_unique UNIQUE (start_block, end_block, scan_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_scan_nodes_claim
        ON scan_nodes (scan_key, "timestamp", start_block)
        WHERE is_leaf_node AND end_timestamp IS NULL
    "#,
];

const NODE_COLUMNS: &str = r#"hash, start_block, end_block, scan_key, tree_depth, is_leaf_node,
    processed_block, parent_start, parent_end, parent_scan_key, parent_tree_depth,
    "timestamp", start_timestamp, end_timestamp"#;

#[derive(Debug, Clone)]
pub struct PostgresScanStore {
    pool: PgPool,
}

impl PostgresScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects, verifies the database answers, and ensures the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("failed to connect to scan store database")?;

        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("scan store failed Postgres health check")?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        tracing::info!("scan store connected to Postgres");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply scan store schema")?;
        }
        Ok(())
    }

    fn map_row(row: &PgRow) -> Result<RangeNode> {
        let start: i64 = row.try_get("start_block").context("read start_block")?;
        let end: i64 = row.try_get("end_block").context("read end_block")?;
        let scan_key: String = row.try_get("scan_key").context("read scan_key")?;
        let tree_depth: i32 = row.try_get("tree_depth").context("read tree_depth")?;
        let is_leaf_node: bool = row.try_get("is_leaf_node").context("read is_leaf_node")?;
        let processed_block: Option<i64> = row
            .try_get("processed_block")
            .context("read processed_block")?;
        let parent_start: Option<i64> = row.try_get("parent_start").context("read parent_start")?;
        let parent_end: Option<i64> = row.try_get("parent_end").context("read parent_end")?;
        let parent_scan_key: Option<String> = row
            .try_get("parent_scan_key")
            .context("read parent_scan_key")?;
        let parent_tree_depth: Option<i32> = row
            .try_get("parent_tree_depth")
            .context("read parent_tree_depth")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp").context("read timestamp")?;
        let start_timestamp: Option<DateTime<Utc>> = row
            .try_get("start_timestamp")
            .context("read start_timestamp")?;
        let end_timestamp: Option<DateTime<Utc>> = row
            .try_get("end_timestamp")
            .context("read end_timestamp")?;

        let parent = match (parent_start, parent_end, parent_scan_key, parent_tree_depth) {
            (Some(start), Some(end), Some(scan_key), Some(depth)) => Some(ParentRef {
                start: from_db(start)?,
                end: from_db(end)?,
                scan_key,
                tree_depth: u32::try_from(depth).context("negative parent_tree_depth")?,
            }),
            _ => None,
        };

        let node = RangeNode::from_parts(RangeNodeParts {
            start: from_db(start)?,
            end: from_db(end)?,
            scan_key,
            tree_depth: u32::try_from(tree_depth).context("negative tree_depth")?,
            is_leaf_node,
            processed_block: processed_block.map(from_db).transpose()?,
            parent,
            timestamp,
            start_timestamp,
            end_timestamp,
        });

        let stored_hash: String = row.try_get("hash").context("read hash")?;
        if stored_hash != node.hash().as_str() {
            anyhow::bail!(
                "stored hash {stored_hash} does not match coordinates of node {}",
                node.hash()
            );
        }
        Ok(node)
    }

    async fn insert_all(&self, nodes: &[RangeNode]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin insert_nodes tx failed")?;
        insert_rows(&mut *tx, nodes).await?;
        tx.commit().await.context("insert_nodes tx commit failed")?;
        Ok(())
    }

    async fn insert_tree_if_absent(&self, scan_key: &str, nodes: &[RangeNode]) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin insert_tree tx failed")?;

        // Serializes creators of the same key until commit; the EXISTS check
        // below then sees any tree committed by the previous holder.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(scan_key)
            .execute(&mut *tx)
            .await
            .context("scan key advisory lock failed")?;

        let taken = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM scan_nodes WHERE scan_key = $1)",
        )
        .bind(scan_key)
        .fetch_one(&mut *tx)
        .await
        .context("scan key existence check failed")?;
        if taken {
            tx.rollback().await.context("insert_tree tx rollback failed")?;
            return Ok(false);
        }

        insert_rows(&mut *tx, nodes).await?;
        tx.commit().await.context("insert_tree tx commit failed")?;
        Ok(true)
    }

    async fn claim(
        &self,
        scan_key: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<RangeNode>> {
        let sql = format!(
            r#"
            UPDATE scan_nodes
            SET start_timestamp = $3,
                "timestamp" = $3
            WHERE hash = (
                SELECT hash
                FROM scan_nodes
                WHERE scan_key = $1
                  AND is_leaf_node
                  AND end_timestamp IS NULL
                  AND (processed_block IS NULL OR processed_block < end_block - 1)
                  AND (start_timestamp IS NULL OR "timestamp" < $2)
                ORDER BY "timestamp" ASC, start_block ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {NODE_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(scan_key)
            .bind(stale_before)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .context("claim_next_leaf update failed")?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn progress(&self, scan_key: &str, block_number: u64, now: DateTime<Utc>) -> Result<bool> {
        let block = to_db(block_number)?;
        let result = sqlx::query(
            r#"
            UPDATE scan_nodes
            SET processed_block = LEAST($2, end_block - 1),
                "timestamp" = $3,
                end_timestamp = CASE
                    WHEN end_timestamp IS NULL AND LEAST($2, end_block - 1) >= end_block - 1 THEN $3
                    ELSE end_timestamp
                END
            WHERE scan_key = $1
              AND is_leaf_node
              AND start_timestamp IS NOT NULL
              AND start_block <= $2
              AND end_block > $2
              AND (processed_block IS NULL OR processed_block < $2)
            "#,
        )
        .bind(scan_key)
        .bind(block)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("record_progress update failed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, scan_key: &str, hash: &NodeHash, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scan_nodes
            SET processed_block = end_block - 1,
                "timestamp" = $3,
                end_timestamp = $3
            WHERE scan_key = $1
              AND hash = $2
              AND end_timestamp IS NULL
            "#,
        )
        .bind(scan_key)
        .bind(hash.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("complete_node update failed")?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, filter: &ScanFilter, incomplete_leaves_only: bool) -> Result<bool> {
        let (span_start, span_end) = span_bounds(filter)?;
        let sql = if incomplete_leaves_only {
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scan_nodes
                WHERE scan_key = $1
                  AND ($2::BIGINT IS NULL OR (start_block < $3 AND end_block > $2))
                  AND is_leaf_node
                  AND end_timestamp IS NULL
                  AND (processed_block IS NULL OR processed_block < end_block - 1)
            )
            "#
        } else {
            r#"
            SELECT EXISTS (
                SELECT 1 FROM scan_nodes
                WHERE scan_key = $1
                  AND ($2::BIGINT IS NULL OR (start_block < $3 AND end_block > $2))
            )
            "#
        };

        sqlx::query_scalar::<_, bool>(sql)
            .bind(&filter.scan_key)
            .bind(span_start)
            .bind(span_end)
            .fetch_one(&self.pool)
            .await
            .context("scan node existence query failed")
    }

    async fn count(&self, filter: &ScanFilter) -> Result<u64> {
        let (span_start, span_end) = span_bounds(filter)?;
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM scan_nodes
            WHERE scan_key = $1
              AND ($2::BIGINT IS NULL OR (start_block < $3 AND end_block > $2))
            "#,
        )
        .bind(&filter.scan_key)
        .bind(span_start)
        .bind(span_end)
        .fetch_one(&self.pool)
        .await
        .context("scan node count query failed")?;

        from_db(count)
    }

    async fn delete_key(&self, scan_key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scan_nodes WHERE scan_key = $1")
            .bind(scan_key)
            .execute(&self.pool)
            .await
            .context("remove_all delete failed")?;
        Ok(result.rows_affected())
    }
}

impl ScanStore for PostgresScanStore {
    fn insert_nodes<'a>(&'a self, nodes: &'a [RangeNode]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.insert_all(nodes))
    }

    fn insert_tree<'a>(
        &'a self,
        scan_key: &'a str,
        nodes: &'a [RangeNode],
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.insert_tree_if_absent(scan_key, nodes))
    }

    fn claim_next_leaf<'a>(
        &'a self,
        scan_key: &'a str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<RangeNode>>> {
        Box::pin(self.claim(scan_key, stale_before, now))
    }

    fn record_progress<'a>(
        &'a self,
        scan_key: &'a str,
        block_number: u64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.progress(scan_key, block_number, now))
    }

    fn complete_node<'a>(
        &'a self,
        scan_key: &'a str,
        hash: &'a NodeHash,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.complete(scan_key, hash, now))
    }

    fn has_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.exists(filter, false))
    }

    fn has_incomplete_leaves<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.exists(filter, true))
    }

    fn count_nodes<'a>(&'a self, filter: &'a ScanFilter) -> BoxFuture<'a, Result<u64>> {
        Box::pin(self.count(filter))
    }

    fn remove_all<'a>(&'a self, scan_key: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(self.delete_key(scan_key))
    }
}

async fn insert_rows(conn: &mut PgConnection, nodes: &[RangeNode]) -> Result<()> {
    for node in nodes {
        let parent = node.parent();
        sqlx::query(
            r#"
            INSERT INTO scan_nodes (
                hash, start_block, end_block, scan_key, tree_depth, is_leaf_node,
                processed_block, parent_start, parent_end, parent_scan_key,
                parent_tree_depth, "timestamp", start_timestamp, end_timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(node.hash().as_str())
        .bind(to_db(node.start())?)
        .bind(to_db(node.end())?)
        .bind(node.scan_key())
        .bind(depth_to_db(node.tree_depth())?)
        .bind(node.is_leaf_node())
        .bind(node.processed_block().map(to_db).transpose()?)
        .bind(parent.map(|p| to_db(p.start)).transpose()?)
        .bind(parent.map(|p| to_db(p.end)).transpose()?)
        .bind(parent.map(|p| p.scan_key.clone()))
        .bind(parent.map(|p| depth_to_db(p.tree_depth)).transpose()?)
        .bind(node.timestamp())
        .bind(node.start_timestamp())
        .bind(node.end_timestamp())
        .execute(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "insert of scan node [{}, {}) for key {} failed",
                node.start(),
                node.end(),
                node.scan_key()
            )
        })?;
    }
    Ok(())
}

fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("block number {value} exceeds BIGINT range"))
}

fn from_db<T>(value: i64) -> Result<T>
where
    T: TryFrom<i64>,
{
    T::try_from(value).map_err(|_| anyhow::anyhow!("stored value {value} is out of range"))
}

fn depth_to_db(depth: u32) -> Result<i32> {
    i32::try_from(depth).with_context(|| format!("tree depth {depth} exceeds INTEGER range"))
}

fn span_bounds(filter: &ScanFilter) -> Result<(Option<i64>, Option<i64>)> {
    match &filter.span {
        Some(span) => Ok((Some(to_db(span.start)?), Some(to_db(span.end)?))),
        None => Ok((None, None)),
    }
}
