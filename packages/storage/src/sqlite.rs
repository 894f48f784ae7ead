// ABOUTME: SQLite implementation of the execution store
// ABOUTME: Conditional UPDATEs act as compare-and-set; triggers append the status history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coderun_core::{ExecutionId, ExecutionRecord, ExecutionStatus, StatusTransition, Transition};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::{ExecutionStore, Result, StoreError};

const RECORD_COLUMNS: &str = "execution_id, language, source_code, status, output, failure_reason,
                              created_at, updated_at, completed_at";

#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` in WAL mode
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("Connected to execution store at {}", database_url);
        Ok(Self::new(pool))
    }

    /// Private in-memory database with migrations applied.
    ///
    /// Uses a single long-lived connection since every SQLite in-memory
    /// connection sees its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Execution store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_record(&self, row: SqliteRow) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            execution_id: ExecutionId::from(row.get::<String, _>("execution_id")),
            language: row.get("language"),
            source_code: row.get("source_code"),
            status: parse_status(&row.get::<String, _>("status"))?,
            output: row.get("output"),
            failure_reason: row.get("failure_reason"),
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
            completed_at: row
                .get::<Option<String>, _>("completed_at")
                .map(|s| parse_timestamp(&s))
                .transpose()?,
        })
    }

    fn row_to_transition(&self, row: SqliteRow) -> Result<StatusTransition> {
        Ok(StatusTransition {
            execution_id: ExecutionId::from(row.get::<String, _>("execution_id")),
            from_status: row
                .get::<Option<String>, _>("from_status")
                .map(|s| parse_status(&s))
                .transpose()?,
            to_status: parse_status(&row.get::<String, _>("to_status"))?,
            output: row.get("output"),
            failure_reason: row.get("failure_reason"),
            recorded_at: parse_timestamp(&row.get::<String, _>("recorded_at"))?,
        })
    }
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::from_str(s).map_err(|e| StoreError::InvalidStatus(e.0))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidTimestamp(format!("{}: {}", s, e)))
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO executions (
                execution_id, language, source_code, status, output, failure_reason,
                created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(record.execution_id.as_str())
        .bind(&record.language)
        .bind(&record.source_code)
        .bind(record.status.as_str())
        .bind(&record.output)
        .bind(&record.failure_reason)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                StoreError::Conflict(record.execution_id.to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, execution_id: &ExecutionId) -> Result<ExecutionRecord> {
        let query = format!(
            "SELECT {} FROM executions WHERE execution_id = ?1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(execution_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;

        self.row_to_record(row)
    }

    async fn compare_and_update(
        &self,
        execution_id: &ExecutionId,
        expected: ExecutionStatus,
        transition: Transition,
    ) -> Result<ExecutionRecord> {
        let to = transition.to();
        let allowed: Vec<&str> = ExecutionStatus::ALL
            .iter()
            .filter(|current| current.accepts(expected, to))
            .map(|current| current.as_str())
            .collect();

        if allowed.is_empty() {
            let current = self.get(execution_id).await?.status;
            return Err(StoreError::StaleUpdate {
                execution_id: execution_id.to_string(),
                expected,
                current,
            });
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = to.is_terminal().then(|| now.clone());
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let query = format!(
            "UPDATE executions
             SET status = ?, output = ?, failure_reason = ?, updated_at = ?,
                 completed_at = COALESCE(completed_at, ?)
             WHERE execution_id = ? AND status IN ({})
             RETURNING {}",
            placeholders, RECORD_COLUMNS
        );

        let mut q = sqlx::query(&query)
            .bind(to.as_str())
            .bind(transition.output())
            .bind(transition.failure_reason())
            .bind(&now)
            .bind(completed_at)
            .bind(execution_id.as_str());
        for status in &allowed {
            q = q.bind(*status);
        }

        if let Some(row) = q.fetch_optional(&self.pool).await? {
            return self.row_to_record(row);
        }

        let current = self.get(execution_id).await?.status;
        debug!(
            execution_id = %execution_id,
            expected = %expected,
            current = %current,
            requested = %to,
            "Rejected stale status update"
        );
        Err(StoreError::StaleUpdate {
            execution_id: execution_id.to_string(),
            expected,
            current,
        })
    }

    async fn history(&self, execution_id: &ExecutionId) -> Result<Vec<StatusTransition>> {
        let rows = sqlx::query(
            "SELECT execution_id, from_status, to_status, output, failure_reason, recorded_at
             FROM execution_transitions
             WHERE execution_id = ?1
             ORDER BY id ASC",
        )
        .bind(execution_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        // Creation always writes the first row
        if rows.is_empty() {
            return Err(StoreError::NotFound(execution_id.to_string()));
        }

        rows.into_iter()
            .map(|row| self.row_to_transition(row))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
