use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Shared SQLite handle for runs, results, validations and the durable test queue.
pub struct Database {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Database {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// File backing this database; `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Cheap liveness probe for the health endpoint.
    pub fn ping(&self) -> anyhow::Result<()> {
        self.conn().query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS test_run (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                config TEXT,
                batch_id TEXT,
                state TEXT NOT NULL,
                state_description TEXT,
                passed INTEGER,
                test_generated_count INTEGER,
                test_result_count INTEGER,
                owner TEXT,
                run_attempts INTEGER NOT NULL DEFAULT 0,
                lock_start_date TEXT,
                lock_end_date TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                create_date TEXT NOT NULL,
                last_update_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_result (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_run_id INTEGER NOT NULL REFERENCES test_run(id) ON DELETE CASCADE,
                test_value TEXT NOT NULL,
                test_type TEXT NOT NULL,
                passed INTEGER NOT NULL,
                request_hash TEXT NOT NULL,
                request_method TEXT NOT NULL,
                request_headers TEXT,
                request_url TEXT NOT NULL,
                request_body TEXT,
                response_hash TEXT,
                response_headers TEXT,
                response_body TEXT,
                response_status_code INTEGER,
                create_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS validation (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                passed INTEGER NOT NULL,
                message TEXT,
                test_result_id INTEGER NOT NULL REFERENCES test_result(id) ON DELETE CASCADE,
                create_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_queue (
                id TEXT NOT NULL,
                test_run_id INTEGER NOT NULL,
                test_hash TEXT NOT NULL,
                test TEXT NOT NULL,
                create_date TEXT NOT NULL,
                PRIMARY KEY (id, test_run_id, test_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_run_state ON test_run(state);
            CREATE INDEX IF NOT EXISTS idx_result_run_id ON test_result(test_run_id);
            CREATE INDEX IF NOT EXISTS idx_result_request_hash ON test_result(request_hash, create_date);
            CREATE INDEX IF NOT EXISTS idx_validation_result_id ON validation(test_result_id);
            CREATE INDEX IF NOT EXISTS idx_queue_run_created ON test_queue(test_run_id, create_date);
        ",
        )?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as strings.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}
