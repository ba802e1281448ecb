use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;

use super::{ResultFilter, StoredResult, StoredValidation, TestResult, ValidationResult};
use crate::db::{now_ts, parse_ts, Database};

const RESULT_COLUMNS: &str = "id, test_run_id, test_type, test_value, passed, request_hash,
    request_method, request_headers, request_url, request_body, response_hash,
    response_headers, response_body, response_status_code, create_date";

fn json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<StoredResult> {
    let create_date: String = row.get(14)?;
    Ok(StoredResult {
        id: row.get(0)?,
        test_run_id: row.get(1)?,
        test_type: row.get(2)?,
        test_value: row.get(3)?,
        passed: row.get::<_, i64>(4)? != 0,
        request_hash: row.get(5)?,
        request_method: row.get(6)?,
        request_headers: json_column(row.get(7)?),
        request_url: row.get(8)?,
        request_body: json_column(row.get(9)?),
        response_hash: row.get(10)?,
        response_headers: json_column(row.get(11)?),
        response_body: json_column(row.get(12)?),
        response_status_code: row.get(13)?,
        create_date: parse_ts(&create_date).unwrap_or_default(),
        validations: Vec::new(),
    })
}

impl Database {
    // ========================================================================
    // Results
    // ========================================================================

    /// Persists a result and its validation rows in one transaction.
    /// The result passes only if every validation passed.
    pub fn insert_result(
        &self,
        result: &TestResult,
        validations: &[ValidationResult],
    ) -> anyhow::Result<i64> {
        let passed = validations.iter().all(|v| v.passed);
        let now = now_ts();
        let to_text = |v: &Option<Value>| v.as_ref().map(|v| v.to_string());
        let response = result.response.as_ref();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO test_result (test_run_id, test_value, test_type, passed, request_hash,
                request_method, request_headers, request_url, request_body, response_hash,
                response_headers, response_body, response_status_code, create_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                result.test_run_id,
                result.test_value,
                result.test_type.as_str(),
                passed,
                result.request.hash,
                result.request.method,
                result
                    .request
                    .headers
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                result.request.url,
                to_text(&result.request.body),
                response.map(|r| r.hash.as_str()),
                response.map(|r| serde_json::to_string(&r.headers)).transpose()?,
                response.map(|r| r.body.to_string()),
                response.map(|r| r.status_code),
                now,
            ],
        )?;
        let result_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO validation (type, passed, message, test_result_id, create_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for validation in validations {
                stmt.execute(params![
                    validation.validation_type,
                    validation.passed,
                    validation.message,
                    result_id,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(result_id)
    }

    pub fn count_results(&self, run_id: i64) -> anyhow::Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM test_result WHERE test_run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    pub fn count_failing_results(&self, run_id: i64) -> anyhow::Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM test_result WHERE test_run_id = ?1 AND passed = 0",
            params![run_id],
            |row| row.get(0),
        )?)
    }

    /// Drops every result of a run; validations go with them.
    pub fn delete_results(&self, run_id: i64) -> anyhow::Result<usize> {
        let conn = self.conn();
        Ok(conn.execute(
            "DELETE FROM test_result WHERE test_run_id = ?1",
            params![run_id],
        )?)
    }

    /// Response hash of the most recent result for `request_hash`, in any run.
    pub fn previous_response_hash(&self, request_hash: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn();
        let hash = conn
            .query_row(
                "SELECT response_hash FROM test_result
                 WHERE request_hash = ?1 AND response_hash IS NOT NULL
                 ORDER BY create_date DESC, id DESC LIMIT 1",
                params![request_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn list_results(
        &self,
        run_id: i64,
        filter: &ResultFilter,
    ) -> anyhow::Result<Vec<StoredResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_result
             WHERE test_run_id = ?1 AND (?2 IS NULL OR passed = ?2)
             ORDER BY id LIMIT ?3 OFFSET ?4",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                run_id,
                filter.passed.map(i64::from),
                filter.limit.unwrap_or(100),
                filter.offset.unwrap_or(0),
            ],
            row_to_result,
        )?;
        let mut results = rows.collect::<Result<Vec<_>, _>>()?;
        attach_validations(&conn, &mut results)?;
        Ok(results)
    }

    /// Results of a run for one request hash. At-least-once delivery means a
    /// test can have more than one.
    pub fn get_results_by_hash(
        &self,
        run_id: i64,
        request_hash: &str,
    ) -> anyhow::Result<Vec<StoredResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_result
             WHERE test_run_id = ?1 AND request_hash = ?2
             ORDER BY id",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, request_hash], row_to_result)?;
        let mut results = rows.collect::<Result<Vec<_>, _>>()?;
        attach_validations(&conn, &mut results)?;
        Ok(results)
    }
}

fn attach_validations(conn: &Connection, results: &mut [StoredResult]) -> anyhow::Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT id, type, passed, message, create_date FROM validation
         WHERE test_result_id = ?1 ORDER BY id",
    )?;
    let mut by_result: HashMap<i64, Vec<StoredValidation>> = HashMap::new();
    for result in results.iter() {
        let rows = stmt.query_map(params![result.id], |row| {
            let create_date: String = row.get(4)?;
            Ok(StoredValidation {
                id: row.get(0)?,
                validation_type: row.get(1)?,
                passed: row.get::<_, i64>(2)? != 0,
                message: row.get(3)?,
                create_date: parse_ts(&create_date).unwrap_or_default(),
            })
        })?;
        by_result.insert(result.id, rows.collect::<Result<Vec<_>, _>>()?);
    }
    for result in results.iter_mut() {
        result.validations = by_result.remove(&result.id).unwrap_or_default();
    }
    Ok(())
}
