use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

use crate::application::ports::ResultSink;
use crate::domain::{
    action::{DatabaseAction, SinkKind},
    errors::{PersistenceFailure, SinkError},
    inspection::{InspectionResult, ProjectContext},
};

fn map_sqlite(err: rusqlite::Error) -> SinkError {
    let reason = match &err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::ConstraintViolation => PersistenceFailure::ConstraintViolation,
            ErrorCode::DiskFull => PersistenceFailure::DiskFull,
            _ => PersistenceFailure::ConnectionLost,
        },
        _ => PersistenceFailure::ConnectionLost,
    };
    SinkError::persistence(reason, err.to_string())
}

fn map_io(err: std::io::Error) -> SinkError {
    // ENOSPC
    let reason = if err.raw_os_error() == Some(28) {
        PersistenceFailure::DiskFull
    } else {
        PersistenceFailure::ConnectionLost
    };
    SinkError::persistence(reason, err.to_string())
}

/// Appends one row per result to a SQLite table, optionally keeping the
/// frame JPEG next to it on disk.
pub struct DatabaseSink {
    connection: Arc<Mutex<Connection>>,
    config: DatabaseAction,
    image_dir: PathBuf,
}

impl DatabaseSink {
    pub fn open(path: &Path, config: DatabaseAction, image_dir: PathBuf) -> Result<Self, SinkError> {
        let connection = Connection::open(path).map_err(map_sqlite)?;
        Self::with_connection(connection, config, image_dir)
    }

    pub fn in_memory(config: DatabaseAction, image_dir: PathBuf) -> Result<Self, SinkError> {
        let connection = Connection::open_in_memory().map_err(map_sqlite)?;
        Self::with_connection(connection, config, image_dir)
    }

    fn with_connection(
        connection: Connection,
        config: DatabaseAction,
        image_dir: PathBuf,
    ) -> Result<Self, SinkError> {
        // Table names are checked as identifiers before they get here.
        connection
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id TEXT PRIMARY KEY,
                        timestamp TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        camera_id TEXT NOT NULL,
                        verdict TEXT NOT NULL,
                        detections TEXT,
                        image_path TEXT,
                        processing_time_ms REAL NOT NULL,
                        failed_models TEXT
                    )",
                    config.table_name
                ),
                [],
            )
            .map_err(map_sqlite)?;
        Ok(Self { connection: Arc::new(Mutex::new(connection)), config, image_dir })
    }

    async fn store_image(&self, result: &InspectionResult) -> Result<Option<String>, SinkError> {
        if !self.config.save_image {
            return Ok(None);
        }
        let (Some(jpeg), Some(image_ref)) = (&result.image, &result.image_ref) else {
            return Ok(None);
        };
        let relative = Path::new(image_ref);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(SinkError::persistence(
                PersistenceFailure::ConstraintViolation,
                format!("image path {image_ref:?} leaves the image directory"),
            ));
        }
        let path = self.image_dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_io)?;
        }
        tokio::fs::write(&path, jpeg.as_slice()).await.map_err(map_io)?;
        Ok(Some(path.to_string_lossy().into_owned()))
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let guard = connection.lock().map_err(|_| {
                SinkError::persistence(PersistenceFailure::ConnectionLost, "connection lock poisoned")
            })?;
            f(&guard).map_err(map_sqlite)
        })
        .await
        .map_err(|e| SinkError::persistence(PersistenceFailure::ConnectionLost, e.to_string()))?
    }
}

#[async_trait]
impl ResultSink for DatabaseSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Database
    }

    async fn deliver(&self, project: &ProjectContext, result: &InspectionResult) -> Result<(), SinkError> {
        let image_path = self.store_image(result).await?;
        let detections = if self.config.save_detections {
            let json = serde_json::to_string(&result.detections).map_err(|e| {
                SinkError::persistence(PersistenceFailure::ConstraintViolation, e.to_string())
            })?;
            Some(json)
        } else {
            None
        };
        let failed_models = if result.failures.is_empty() {
            None
        } else {
            serde_json::to_string(&result.failures).ok()
        };

        let sql = format!(
            "INSERT INTO {} (id, timestamp, project_id, camera_id, verdict, detections, image_path, processing_time_ms, failed_models)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO NOTHING",
            self.config.table_name
        );
        let row = (
            result.id.to_string(),
            result.timestamp.to_rfc3339(),
            project.id.clone(),
            result.camera_id.to_string(),
            result.verdict.as_str(),
            detections,
            image_path,
            result.processing_time_ms,
            failed_models,
        );
        // Result ids are unique, so an existing row is this result from an
        // earlier attempt whose commit outlived its timeout.
        let inserted = self
            .with_db(move |conn| {
                conn.execute(
                    &sql,
                    rusqlite::params![row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8],
                )
            })
            .await?;
        if inserted == 0 {
            debug!(result = %result.id, "result already stored");
        } else {
            debug!(result = %result.id, table = %self.config.table_name, "result stored");
        }
        Ok(())
    }

    async fn probe(&self) -> Result<(), SinkError> {
        self.with_db(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }
}
