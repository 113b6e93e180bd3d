//! SQLite-based state store for the reconciliation platform.
//!
//! Holds the small amount of state that must survive process restarts:
//!
//! - The previous plan fingerprint, as a versioned record replaced only
//!   via compare-and-swap after a fully successful rewrite.
//! - The vehicle credentials, replaced atomically by the worker's token
//!   custodian and read by everyone else.
//! - A run-status record so silent failure (a stuck stale fingerprint)
//!   is observable from the status endpoint.
//!
//! The worker opens the store read-write; the scout opens the same file
//! read-only. WAL mode keeps cross-process reads from blocking writes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use amp_vehicle::CredentialSet;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Compare-and-swap lost to a concurrent writer.
    #[error("fingerprint version conflict: expected {expected:?}, found {found:?}")]
    Conflict {
        expected: Option<i64>,
        found: Option<i64>,
    },

    #[error("invalid stored state: {0}")]
    Invalid(String),
}

/// Versioned fingerprint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    /// Monotonic version, bumped on every successful swap.
    pub version: i64,

    /// The fingerprint value (`sha256:<hex>`).
    pub value: String,

    /// When the record was last replaced.
    pub updated_at: DateTime<Utc>,
}

/// Terminal status of the most recent reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_cycle_status: Option<String>,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a read-write store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL so the scout's read-only handle never blocks the worker.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an existing store read-only (scout's credential cache).
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plan_fingerprint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_success_at INTEGER,
                last_error TEXT,
                last_error_at INTEGER,
                last_cycle_status TEXT
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Load the current fingerprint record, if any.
    pub fn load_fingerprint(&self) -> Result<Option<FingerprintRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT version, value, updated_at FROM plan_fingerprint WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(version, value, updated_at)| {
            Ok(FingerprintRecord {
                version,
                value,
                updated_at: ts_from_unix(updated_at)?,
            })
        })
        .transpose()
    }

    /// Replace the fingerprint via compare-and-swap.
    ///
    /// `expected_version` must match the stored version (`None` when no
    /// record exists yet); otherwise the swap fails with `Conflict` and
    /// the stored value is untouched. Returns the new version.
    pub fn swap_fingerprint(
        &self,
        expected_version: Option<i64>,
        value: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let found: Option<i64> = tx
            .query_row(
                "SELECT version FROM plan_fingerprint WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if found != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found,
            });
        }

        let new_version = expected_version.unwrap_or(0) + 1;
        let now = Utc::now().timestamp();
        tx.execute(
            "INSERT INTO plan_fingerprint (id, version, value, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET version = ?1, value = ?2, updated_at = ?3",
            params![new_version, value, now],
        )?;
        tx.commit()?;

        debug!(version = new_version, fingerprint = %value, "Fingerprint replaced");
        Ok(new_version)
    }

    /// Load the stored credentials, if any.
    pub fn load_credentials(&self) -> Result<Option<CredentialSet>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT access_token, refresh_token, expires_at FROM credentials WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(access_token, refresh_token, expires_at)| {
            Ok(CredentialSet {
                access_token,
                refresh_token,
                expires_at: ts_from_unix(expires_at)?,
            })
        })
        .transpose()
    }

    /// Atomically replace the stored credentials.
    pub fn put_credentials(&self, creds: &CredentialSet) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO credentials (id, access_token, refresh_token, expires_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                access_token = ?1, refresh_token = ?2, expires_at = ?3, updated_at = ?4",
            params![
                creds.access_token,
                creds.refresh_token,
                creds.expires_at.timestamp(),
                now
            ],
        )?;
        Ok(())
    }

    /// Record a successful cycle terminal status.
    pub fn record_cycle_success(&self, status: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO run_status (id, last_success_at, last_cycle_status)
             VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET last_success_at = ?1, last_cycle_status = ?2",
            params![now, status],
        )?;
        Ok(())
    }

    /// Record a failed cycle terminal status.
    pub fn record_cycle_failure(&self, error: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO run_status (id, last_error, last_error_at, last_cycle_status)
             VALUES (1, ?1, ?2, 'failed')
             ON CONFLICT (id) DO UPDATE SET
                last_error = ?1, last_error_at = ?2, last_cycle_status = 'failed'",
            params![error, now],
        )?;
        Ok(())
    }

    /// Load the run-status record.
    pub fn load_run_status(&self) -> Result<RunStatus, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT last_success_at, last_error, last_error_at, last_cycle_status
                 FROM run_status WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((success_at, last_error, error_at, last_cycle_status)) = row else {
            return Ok(RunStatus::default());
        };

        Ok(RunStatus {
            last_success_at: success_at.map(ts_from_unix).transpose()?,
            last_error,
            last_error_at: error_at.map(ts_from_unix).transpose()?,
            last_cycle_status,
        })
    }
}

fn ts_from_unix(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::Invalid(format!("timestamp {secs} out of range")))
}
