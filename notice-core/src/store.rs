use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS raw_sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id_hash TEXT NOT NULL UNIQUE,
        subject TEXT,
        sender TEXT,
        received_at TEXT NOT NULL,
        body_text TEXT,
        body_html TEXT,
        has_html_body INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_raw_sources_received ON raw_sources(received_at);

    CREATE TABLE IF NOT EXISTS extractions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        processing_status TEXT NOT NULL DEFAULT 'unprocessed',
        extracted_service_name TEXT,
        event_start_time TEXT,
        event_end_time TEXT,
        notification_type TEXT,
        severity TEXT,
        summary TEXT,
        raw_response TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_extractions_status ON extractions(processing_status);
    CREATE INDEX IF NOT EXISTS idx_extractions_service ON extractions(extracted_service_name);

    CREATE TABLE IF NOT EXISTS notifications (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT,
        status TEXT NOT NULL DEFAULT 'new',
        raw_source_id INTEGER NOT NULL UNIQUE REFERENCES raw_sources(id),
        extraction_id INTEGER NOT NULL UNIQUE REFERENCES extractions(id),
        last_checked_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status);

    CREATE TABLE IF NOT EXISTS external_services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        provider TEXT,
        description TEXT
    );

    CREATE TABLE IF NOT EXISTS internal_systems (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        responsible_contact TEXT,
        description TEXT
    );

    CREATE TABLE IF NOT EXISTS dependencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        internal_system_id INTEGER NOT NULL REFERENCES internal_systems(id),
        external_service_id INTEGER NOT NULL REFERENCES external_services(id),
        description TEXT,
        UNIQUE (internal_system_id, external_service_id)
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_service ON dependencies(external_service_id);

    CREATE TABLE IF NOT EXISTS notification_impacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        notification_id INTEGER NOT NULL REFERENCES notifications(id),
        internal_system_id INTEGER NOT NULL REFERENCES internal_systems(id),
        created_at TEXT NOT NULL,
        UNIQUE (notification_id, internal_system_id)
    );

    CREATE TABLE IF NOT EXISTS downtime_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_service_id INTEGER NOT NULL REFERENCES external_services(id),
        start_notification_id INTEGER NOT NULL REFERENCES notifications(id),
        end_notification_id INTEGER REFERENCES notifications(id),
        start_time TEXT NOT NULL,
        end_time TEXT,
        severity TEXT,
        summary TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_downtime_service ON downtime_events(external_service_id, end_time);
    CREATE INDEX IF NOT EXISTS idx_downtime_start_notification ON downtime_events(start_notification_id);
    CREATE INDEX IF NOT EXISTS idx_downtime_end_notification ON downtime_events(end_notification_id);
";

/// Handle on the SQLite database. Every call opens its own connection, so
/// clones can be moved into independent worker threads.
///
/// Foreign keys are declared but not enforced: owned records are cascaded by
/// the lifecycle manager, and drift is left visible for the reconciler.
#[derive(Clone, Debug)]
pub struct Store {
    db_path: Arc<PathBuf>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::ExternalCall(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let store = Self {
            db_path: Arc::new(path.to_path_buf()),
        };
        let conn = store.connection()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "store schema ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    /// Runs `f` inside a transaction that holds the write lock from the start,
    /// committing only when it returns `Ok`. Read-then-write bodies never see a
    /// snapshot another writer has already moved past.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
