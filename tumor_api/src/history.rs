//! Prediction history and user feedback, persisted in SQLite.

use crate::config::HistoryConfig;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::task::{self, JoinError};
use tumor_inference::TumorClass;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to create history directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("History database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("History storage worker failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: String,
    /// Stored upload name, served under `/uploads/`.
    pub filename: String,
    pub class: TumorClass,
    pub confidence: f32,
    pub probability: f32,
    pub processing_time_seconds: f64,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct PredictionPage {
    pub records: Vec<PredictionRecord>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub prediction_id: String,
    pub is_correct: bool,
    pub comment: Option<String>,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct PredictionStore {
    db_path: PathBuf,
}

impl PredictionStore {
    pub fn initialize(config: &HistoryConfig) -> Result<Self, HistoryError> {
        let db_path = config.database_path.clone();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = open_connection(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                class TEXT NOT NULL,
                confidence REAL NOT NULL,
                probability REAL NOT NULL,
                processing_time REAL NOT NULL,
                created_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_predictions_created_at
                ON predictions(created_at DESC);

            CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prediction_id TEXT NOT NULL REFERENCES predictions(id) ON DELETE CASCADE,
                is_correct INTEGER NOT NULL,
                comment TEXT NULL,
                created_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_feedback_prediction_id
                ON feedback(prediction_id);
            "#,
        )?;

        tracing::info!("Prediction history stored in {:?}", db_path);
        Ok(Self { db_path })
    }

    pub async fn record(&self, record: PredictionRecord) -> Result<(), HistoryError> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO predictions (
                    id,
                    filename,
                    class,
                    confidence,
                    probability,
                    processing_time,
                    created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.id,
                    record.filename,
                    record.class.as_str(),
                    f64::from(record.confidence),
                    f64::from(record.probability),
                    record.processing_time_seconds,
                    record.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Newest predictions first, skipping the `skip` most recent ones.
    pub async fn list(&self, skip: u32, limit: u32) -> Result<PredictionPage, HistoryError> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM predictions", [], |row| {
                row.get(0)
            })?;

            let mut stmt = conn.prepare(
                r#"
                SELECT
                    id,
                    filename,
                    class,
                    confidence,
                    probability,
                    processing_time,
                    created_at
                FROM predictions
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?1 OFFSET ?2
                "#,
            )?;
            let rows = stmt.query_map(
                params![i64::from(limit), i64::from(skip)],
                map_prediction_record,
            )?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }

            Ok(PredictionPage {
                records,
                total: u64::try_from(total).unwrap_or_default(),
            })
        })
        .await
    }

    pub async fn get(&self, id: String) -> Result<Option<PredictionRecord>, HistoryError> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let record = conn
                .query_row(
                    r#"
                    SELECT
                        id,
                        filename,
                        class,
                        confidence,
                        probability,
                        processing_time,
                        created_at
                    FROM predictions
                    WHERE id = ?1
                    "#,
                    params![id],
                    map_prediction_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Stores feedback and returns its id, or `None` when the prediction does not exist.
    pub async fn add_feedback(&self, feedback: NewFeedback) -> Result<Option<i64>, HistoryError> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let exists = conn
                .query_row(
                    "SELECT 1 FROM predictions WHERE id = ?1",
                    params![feedback.prediction_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            conn.execute(
                r#"
                INSERT INTO feedback (prediction_id, is_correct, comment, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    feedback.prediction_id,
                    feedback.is_correct,
                    feedback.comment,
                    feedback.created_at
                ],
            )?;
            Ok(Some(conn.last_insert_rowid()))
        })
        .await
    }

    async fn run_blocking<F, T>(&self, task_fn: F) -> Result<T, HistoryError>
    where
        F: FnOnce(PathBuf) -> Result<T, HistoryError> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || task_fn(db_path)).await?
    }
}

fn map_prediction_record(row: &Row<'_>) -> rusqlite::Result<PredictionRecord> {
    let class: String = row.get(2)?;
    let class = TumorClass::from_label(&class).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown prediction class {class:?}").into(),
        )
    })?;

    Ok(PredictionRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        class,
        confidence: row.get::<_, f64>(3)? as f32,
        probability: row.get::<_, f64>(4)? as f32,
        processing_time_seconds: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn open_connection(path: &Path) -> Result<Connection, HistoryError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(3))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}
