use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{NewTestRun, RunFilter, RunState, RunUpdate, StateDescription, TestRun};
use crate::db::{format_ts, now_ts, parse_ts, Database};

const RUN_COLUMNS: &str = "id, endpoint, config, batch_id, state, state_description, passed,
    test_generated_count, test_result_count, owner, run_attempts, lock_start_date,
    lock_end_date, version, create_date, last_update_date";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    let endpoint: String = row.get(1)?;
    let config: Option<String> = row.get(2)?;
    let state: String = row.get(4)?;
    let create_date: String = row.get(14)?;
    let last_update_date: String = row.get(15)?;
    Ok(TestRun {
        id: row.get(0)?,
        endpoint: serde_json::from_str(&endpoint).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        config: config.and_then(|c| serde_json::from_str(&c).ok()),
        batch_id: row.get(3)?,
        state: state.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        state_description: row.get(5)?,
        passed: row.get::<_, Option<i64>>(6)?.map(|p| p != 0),
        test_generated_count: row.get(7)?,
        test_result_count: row.get(8)?,
        owner: row.get(9)?,
        run_attempts: row.get(10)?,
        lock_start: row.get::<_, Option<String>>(11)?.as_deref().and_then(parse_ts),
        lock_end: row.get::<_, Option<String>>(12)?.as_deref().and_then(parse_ts),
        version: row.get(13)?,
        create_date: parse_ts(&create_date).unwrap_or_default(),
        last_update_date: parse_ts(&last_update_date).unwrap_or_default(),
    })
}

impl Database {
    // ========================================================================
    // Runs
    // ========================================================================

    pub fn insert_run(&self, run: &NewTestRun) -> anyhow::Result<i64> {
        let conn = self.conn();
        let now = now_ts();
        conn.execute(
            "INSERT INTO test_run (endpoint, config, batch_id, state, state_description,
                run_attempts, version, create_date, last_update_date)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, ?6, ?6)",
            params![
                serde_json::to_string(&run.endpoint)?,
                run.config.as_ref().map(|c| c.to_string()),
                run.batch_id,
                RunState::Pending.as_str(),
                StateDescription::Pending.as_str(),
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> anyhow::Result<Option<TestRun>> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {} FROM test_run WHERE id=?1", RUN_COLUMNS),
                params![run_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> anyhow::Result<Vec<TestRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_run
             WHERE (?1 IS NULL OR state = ?1)
               AND (?2 IS NULL OR passed = ?2)
               AND (?3 IS NULL OR batch_id = ?3)
             ORDER BY id LIMIT ?4 OFFSET ?5",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                filter.state.map(|s| s.as_str()),
                filter.passed.map(i64::from),
                filter.batch_id,
                filter.limit.unwrap_or(100),
                filter.offset.unwrap_or(0),
            ],
            row_to_run,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Oldest run still in a claimable state whose lease is absent or expired.
    pub fn find_claimable_run(&self, now: DateTime<Utc>) -> anyhow::Result<Option<TestRun>> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!(
                    "SELECT {} FROM test_run
                     WHERE state IN ('PENDING', 'GENERATING', 'RUNNING')
                       AND (lock_end_date IS NULL OR lock_end_date < ?1)
                     ORDER BY create_date ASC, id ASC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![format_ts(now)],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Conditional write: applies only if the stored `version` still equals
    /// `expected_version`, and bumps it. Returns false when another writer won.
    pub fn update_run(
        &self,
        run_id: i64,
        expected_version: i64,
        update: &RunUpdate,
    ) -> anyhow::Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE test_run SET
                state = COALESCE(?3, state),
                state_description = COALESCE(?4, state_description),
                passed = COALESCE(?5, passed),
                test_generated_count = COALESCE(?6, test_generated_count),
                test_result_count = COALESCE(?7, test_result_count),
                run_attempts = COALESCE(?8, run_attempts),
                owner = COALESCE(?9, owner),
                lock_start_date = COALESCE(?10, lock_start_date),
                lock_end_date = COALESCE(?11, lock_end_date),
                version = version + 1,
                last_update_date = ?12
             WHERE id = ?1 AND version = ?2",
            params![
                run_id,
                expected_version,
                update.state.map(|s| s.as_str()),
                update.state_description,
                update.passed.map(i64::from),
                update.test_generated_count,
                update.test_result_count,
                update.run_attempts,
                update.owner,
                update.lock_start.map(format_ts),
                update.lock_end.map(format_ts),
                now_ts(),
            ],
        )?;
        if changed == 0 {
            debug!(
                "Version {} of test run {} is stale, update not applied",
                expected_version, run_id
            );
        }
        Ok(changed == 1)
    }

    /// Read-modify-write loop for the lease holder's own bookkeeping.
    ///
    /// `f` sees the freshest copy of the run and returns the update to apply,
    /// or `None` to leave the run alone. A lost version race re-reads and
    /// retries up to `max_retries` times. Returns whether an update landed.
    pub fn modify_run<F>(&self, run_id: i64, max_retries: u32, f: F) -> anyhow::Result<bool>
    where
        F: Fn(&TestRun) -> Option<RunUpdate>,
    {
        for attempt in 0..=max_retries {
            let run = self
                .get_run(run_id)?
                .ok_or_else(|| anyhow::anyhow!("test run {} does not exist", run_id))?;
            let update = match f(&run) {
                Some(update) => update,
                None => return Ok(false),
            };
            if self.update_run(run_id, run.version, &update)? {
                return Ok(true);
            }
            debug!(
                "Retrying update of test run {} after version conflict (attempt {})",
                run_id,
                attempt + 1
            );
        }
        anyhow::bail!(
            "test run {} kept changing underneath us, gave up after {} retries",
            run_id,
            max_retries
        )
    }

    /// Applies `update` unless the run already reached a terminal state.
    pub fn update_active_run(
        &self,
        run_id: i64,
        max_retries: u32,
        update: RunUpdate,
    ) -> anyhow::Result<bool> {
        self.modify_run(run_id, max_retries, |run| {
            if run.state.is_terminal() {
                debug!(
                    "Test run {} already {}, not moving it to {:?}",
                    run.id, run.state, update.state
                );
                None
            } else {
                Some(update.clone())
            }
        })
    }

    /// Moves a still-active run to CANCELLED. False when it already finished.
    pub fn cancel_run(&self, run_id: i64, max_retries: u32) -> anyhow::Result<bool> {
        self.update_active_run(
            run_id,
            max_retries,
            RunUpdate::state(RunState::Cancelled, StateDescription::Cancelled),
        )
    }
}
