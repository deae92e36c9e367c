use chrono::{DateTime, FixedOffset};
use msgtrack_core::reconcile::{Mutation, ScanTouch, StatusPatch};
use msgtrack_core::{
    DeliveryStatus, MessageStatusRecord, StatusEvent, StatusStore, StoreError, WriteOutcome,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const STATUS_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const RECORD_COLUMNS: &str = "
    message_id,
    conversation_id,
    latest_status,
    latest_timestamp,
    latest_timestamp_formatted,
    status_history_json,
    status_count,
    workflow_id,
    first_seen_at,
    last_updated_at,
    last_scanned_at
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for StoreError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(failure, message)) => {
                let detail = message.unwrap_or_else(|| failure.to_string());
                match failure.code {
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied => StoreError::Unavailable(detail),
                    _ => StoreError::Rejected(detail),
                }
            }
            StorageError::Sqlite(rusqlite::Error::FromSqlConversionFailure(_, _, err)) => {
                StoreError::Corrupt(err.to_string())
            }
            StorageError::Sqlite(err) => StoreError::Rejected(err.to_string()),
            StorageError::Serialization(message) | StorageError::Timestamp(message) => {
                StoreError::Corrupt(message)
            }
            err @ StorageError::UnsupportedSchemaVersion { .. } => {
                StoreError::Unavailable(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

/// Message status collection kept in one SQLite table, one row per message id.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STATUS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STATUS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_message_status.sql");
            self.conn.execute_batch(sql)?;
            self.conn.execute("PRAGMA user_version = 1", [])?;
        }

        Ok(())
    }

    pub fn record(&self, message_id: &str) -> Result<Option<MessageStatusRecord>, StorageError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM message_statuses WHERE message_id = ?1");
        let record = self
            .conn
            .query_row(&sql, [message_id], read_record)
            .optional()?;
        Ok(record)
    }

    /// Inserts a first-sighting record unless one already exists.
    /// Returns `false` when another writer created the record first.
    pub fn insert_if_absent(&self, record: &MessageStatusRecord) -> Result<bool, StorageError> {
        let history_json = serde_json::to_string(&record.status_history)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let changes = self.conn.execute(
            "
            INSERT INTO message_statuses (
                message_id,
                conversation_id,
                latest_status,
                latest_timestamp,
                latest_timestamp_formatted,
                status_history_json,
                status_count,
                workflow_id,
                first_seen_at,
                last_updated_at,
                last_scanned_at,
                last_scanned_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(message_id) DO NOTHING
            ",
            params![
                record.message_id,
                record.conversation_id,
                record.latest_status.as_str(),
                record.latest_timestamp,
                record.latest_timestamp_formatted,
                history_json,
                record.status_count as i64,
                record.workflow_id,
                record.first_seen_at.to_rfc3339(),
                record.last_updated_at.to_rfc3339(),
                record.last_scanned_at.to_rfc3339(),
                record.last_scanned_at.timestamp_millis(),
            ],
        )?;

        Ok(changes > 0)
    }

    /// Replaces history-derived fields while the stored count still matches
    /// the count the patch was computed from.
    pub fn apply_patch(&self, patch: &StatusPatch) -> Result<bool, StorageError> {
        let history_json = serde_json::to_string(&patch.status_history)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let changes = self.conn.execute(
            "
            UPDATE message_statuses SET
                status_history_json = ?3,
                status_count = ?4,
                latest_status = ?5,
                latest_timestamp = ?6,
                latest_timestamp_formatted = ?7,
                workflow_id = ?8,
                last_updated_at = ?9,
                last_scanned_at = CASE WHEN ?11 > last_scanned_ms THEN ?10 ELSE last_scanned_at END,
                last_scanned_ms = MAX(last_scanned_ms, ?11)
            WHERE message_id = ?1 AND status_count = ?2
            ",
            params![
                patch.message_id,
                patch.expected_status_count as i64,
                history_json,
                patch.status_count as i64,
                patch.latest_status.as_str(),
                patch.latest_timestamp,
                patch.latest_timestamp_formatted,
                patch.workflow_id,
                patch.last_updated_at.to_rfc3339(),
                patch.last_scanned_at.to_rfc3339(),
                patch.last_scanned_at.timestamp_millis(),
            ],
        )?;

        Ok(changes > 0)
    }

    /// Records a scan that found nothing new. Returns `false` when the record
    /// does not exist.
    pub fn touch_scanned(&self, touch: &ScanTouch) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE message_statuses SET
                last_scanned_at = CASE WHEN ?3 > last_scanned_ms THEN ?2 ELSE last_scanned_at END,
                last_scanned_ms = MAX(last_scanned_ms, ?3)
            WHERE message_id = ?1
            ",
            params![
                touch.message_id,
                touch.last_scanned_at.to_rfc3339(),
                touch.last_scanned_at.timestamp_millis(),
            ],
        )?;

        Ok(changes > 0)
    }

    pub fn records_for_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StorageError> {
        let sql = format!(
            "
            SELECT {RECORD_COLUMNS}
            FROM message_statuses
            WHERE conversation_id = ?1
            ORDER BY latest_timestamp DESC, message_id ASC
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params![conversation_id, limit_param(limit)], read_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn records_with_latest_status(
        &self,
        status: &DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StorageError> {
        let sql = format!(
            "
            SELECT {RECORD_COLUMNS}
            FROM message_statuses
            WHERE latest_status = ?1
            ORDER BY latest_timestamp DESC, message_id ASC
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params![status.as_str(), limit_param(limit)], read_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn recent_records(&self, limit: usize) -> Result<Vec<MessageStatusRecord>, StorageError> {
        let sql = format!(
            "
            SELECT {RECORD_COLUMNS}
            FROM message_statuses
            ORDER BY latest_timestamp DESC, message_id ASC
            LIMIT ?1
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([limit_param(limit)], read_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn record_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM message_statuses", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn index_exists(&self, index_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='index' AND name = ?1 LIMIT 1",
                [index_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl StatusStore for MessageStore {
    fn find(&self, message_id: &str) -> Result<Option<MessageStatusRecord>, StoreError> {
        Ok(self.record(message_id)?)
    }

    fn write(&self, mutation: &Mutation) -> Result<WriteOutcome, StoreError> {
        let applied = match mutation {
            Mutation::Insert(record) => self.insert_if_absent(record)?,
            Mutation::Patch(patch) => self.apply_patch(patch)?,
            Mutation::Touch(touch) => self.touch_scanned(touch)?,
        };
        Ok(if applied {
            WriteOutcome::Applied
        } else {
            WriteOutcome::Conflict
        })
    }

    fn by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StoreError> {
        Ok(self.records_for_conversation(conversation_id, limit)?)
    }

    fn by_latest_status(
        &self,
        status: &DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StoreError> {
        Ok(self.records_with_latest_status(status, limit)?)
    }

    fn recent(&self, limit: usize) -> Result<Vec<MessageStatusRecord>, StoreError> {
        Ok(self.recent_records(limit)?)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<MessageStatusRecord> {
    let history_json: String = row.get(5)?;
    let status_history: Vec<StatusEvent> = serde_json::from_str(&history_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let status_count = row.get::<_, i64>(6)?;

    Ok(MessageStatusRecord {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        latest_status: DeliveryStatus::from(row.get::<_, String>(2)?),
        latest_timestamp: row.get(3)?,
        latest_timestamp_formatted: row.get(4)?,
        status_history,
        status_count: usize::try_from(status_count).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Integer,
                Box::new(err),
            )
        })?,
        workflow_id: row.get(7)?,
        first_seen_at: timestamp_column(row, 8)?,
        last_updated_at: timestamp_column(row, 9)?,
        last_scanned_at: timestamp_column(row, 10)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<FixedOffset>> {
    parse_timestamp(row.get::<_, String>(index)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<FixedOffset>, StorageError> {
    DateTime::parse_from_rfc3339(&value).map_err(|err| StorageError::Timestamp(err.to_string()))
}
