use chrono::{DateTime, Utc};
use rusqlite::params;

use super::QueueItem;
use crate::db::{format_ts, parse_ts, Database};

impl Database {
    // ========================================================================
    // Test queue
    // ========================================================================

    pub fn queue_push_batch(&self, items: &[QueueItem]) -> anyhow::Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO test_queue (id, test_run_id, test_hash, test, create_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for item in items {
                stmt.execute(params![
                    item.id,
                    item.test_run_id,
                    item.test_hash,
                    serde_json::to_string(&item.test)?,
                    format_ts(item.create_date),
                ])?;
            }
        }
        tx.commit()?;
        Ok(items.len())
    }

    pub fn queue_pop(&self, run_id: i64, batch_size: usize) -> anyhow::Result<Vec<QueueItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, test_run_id, test_hash, test, create_date FROM test_queue
             WHERE test_run_id = ?1
             ORDER BY create_date ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![run_id, batch_size as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, test_run_id, test_hash, test, create_date) = row?;
            items.push(QueueItem {
                id,
                test_run_id,
                test_hash,
                test: serde_json::from_str(&test)?,
                create_date: parse_ts(&create_date).unwrap_or_default(),
            });
        }
        Ok(items)
    }

    pub fn queue_ack(&self, run_id: i64, items: &[QueueItem]) -> anyhow::Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM test_queue WHERE id = ?1 AND test_run_id = ?2 AND test_hash = ?3",
            )?;
            for item in items {
                deleted += stmt.execute(params![item.id, run_id, item.test_hash])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn queue_remove_run(&self, run_id: i64) -> anyhow::Result<usize> {
        let conn = self.conn();
        Ok(conn.execute("DELETE FROM test_queue WHERE test_run_id = ?1", params![run_id])?)
    }

    pub fn queue_trim_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.conn();
        Ok(conn.execute(
            "DELETE FROM test_queue WHERE create_date < ?1",
            params![format_ts(cutoff)],
        )?)
    }

    pub fn queue_size(&self, run_id: i64) -> anyhow::Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM test_queue WHERE test_run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }
}
