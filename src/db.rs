use crate::models::{FireEvent, NewFireEvent};
use log::{error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to acquire database connection: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("export I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("export serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_EVENTS: &str =
    "SELECT id, timestamp, min_temp, max_temp, center_temp, fire_detected, mode FROM fire_events";

/// Append-only log of fire-detection events.
///
/// Every call checks a connection out of the pool and returns it on drop,
/// so no handle outlives the operation that needed it. Writes run in
/// autocommit mode and are durable once `append` returns.
pub struct EventStore {
    pool: Pool<SqliteConnectionManager>,
}

impl EventStore {
    /// Opens (or creates) the database file behind a small connection pool.
    /// WAL lets readers run alongside the appending session worker.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        Ok(Self { pool })
    }

    /// In-memory store. Pool size is pinned to one since every SQLite
    /// memory connection is its own database.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.initialize_db()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn()?;
        info!("Initializing fire event schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS fire_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            min_temp REAL,
            max_temp REAL,
            center_temp REAL,
            fire_detected BOOLEAN NOT NULL,
            mode TEXT NOT NULL
        );
        "#,
        ) {
            Ok(_) => {
                info!("Fire event schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize fire event schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Inserts a new event and returns it with its assigned identifier.
    pub fn append(&self, event: &NewFireEvent) -> Result<FireEvent> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO fire_events (timestamp, min_temp, max_temp, center_temp, fire_detected, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.timestamp,
                event.min_temp,
                event.max_temp,
                event.center_temp,
                event.fire_detected,
                event.mode
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(FireEvent {
            id,
            timestamp: event.timestamp.clone(),
            min_temp: event.min_temp,
            max_temp: event.max_temp,
            center_temp: event.center_temp,
            fire_detected: event.fire_detected,
            mode: event.mode.clone(),
        })
    }

    /// Events in ascending id order, optionally restricted to one detection state.
    pub fn query(&self, detected_filter: Option<bool>) -> Result<Vec<FireEvent>> {
        let conn = self.conn()?;

        let events = match detected_filter {
            Some(detected) => {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_EVENTS} WHERE fire_detected = ?1 ORDER BY id"))?;
                let rows = stmt.query_map(params![detected], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{SELECT_EVENTS} ORDER BY id"))?;
                let rows = stmt.query_map([], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(events)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM fire_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Deletes every event. Identifiers are not reused afterwards.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM fire_events", [])?;
        info!("Cleared {} fire events.", removed);
        Ok(removed)
    }

    /// Writes the (filtered) events to `path` as a JSON array. Returns the
    /// number of exported events.
    pub fn export_json(&self, path: impl AsRef<Path>, detected_filter: Option<bool>) -> Result<usize> {
        let events = self.query(detected_filter)?;
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut writer, &events)?;
        writer.flush()?;
        info!("Exported {} fire events to {}.", events.len(), path.as_ref().display());
        Ok(events.len())
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<FireEvent> {
    Ok(FireEvent {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        min_temp: row.get(2)?,
        max_temp: row.get(3)?,
        center_temp: row.get(4)?,
        fire_detected: row.get(5)?,
        mode: row.get(6)?,
    })
}
