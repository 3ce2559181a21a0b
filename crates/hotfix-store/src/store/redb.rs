use chrono::{DateTime, Utc};
use redb::TableError::TableDoesNotExist;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::StoreError;
use crate::session_id::SessionId;
use crate::store::{
    check_sequence_number, now, run_blocking, MessageStore, SessionRecord, StoreFactory,
    DEFAULT_OPERATION_TIMEOUT,
};

const SENDER: &str = "sender";
const TARGET: &str = "target";
const CREATION_TIME: &str = "creation_time";
const LAST_RESET_TIME: &str = "last_reset_time";

fn redb_error(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Redb(err.into())
}

/// Table names for one session, e.g. `messages/FIX.4.4-SENDER-TARGET`.
#[derive(Clone, Debug)]
struct Tables {
    messages: String,
    seq_numbers: String,
}

impl Tables {
    fn new(session_id: &SessionId) -> Self {
        Self {
            messages: format!("messages/{}", session_id.storage_key()),
            seq_numbers: format!("seq_numbers/{}", session_id.storage_key()),
        }
    }

    fn messages(&self) -> TableDefinition<'_, u64, &'static [u8]> {
        TableDefinition::new(&self.messages)
    }

    fn seq_numbers(&self) -> TableDefinition<'_, &'static str, u64> {
        TableDefinition::new(&self.seq_numbers)
    }

    fn read_record(&self, db: &Database) -> Result<Option<SessionRecord>, StoreError> {
        let read_txn = db.begin_read().map_err(redb_error)?;
        let record = match read_txn.open_table(self.seq_numbers()) {
            Ok(table) => self.record_from(&table),
            Err(TableDoesNotExist(_)) => Ok(None),
            Err(err) => Err(redb_error(err)),
        };
        record
    }

    /// Reads the record as seen by `write_txn`, before it is changed in the same transaction.
    fn read_record_for_update(
        &self,
        write_txn: &WriteTransaction,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let table = write_txn
            .open_table(self.seq_numbers())
            .map_err(redb_error)?;
        self.record_from(&table)
    }

    fn record_from(
        &self,
        table: &impl ReadableTable<&'static str, u64>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let get = |key: &'static str| -> Result<Option<u64>, StoreError> {
            Ok(table.get(key).map_err(redb_error)?.map(|v| v.value()))
        };

        match (
            get(SENDER)?,
            get(TARGET)?,
            get(CREATION_TIME)?,
            get(LAST_RESET_TIME)?,
        ) {
            (Some(sender), Some(target), Some(created), Some(reset)) => Ok(Some(SessionRecord {
                next_sender_seq_number: sender,
                next_target_seq_number: target,
                creation_time: from_micros(created)?,
                last_reset_time: from_micros(reset)?,
            })),
            (None, None, None, None) => Ok(None),
            _ => Err(StoreError::Corrupt(format!(
                "incomplete sequence number table {}",
                self.seq_numbers
            ))),
        }
    }

    fn write_record(
        &self,
        write_txn: &WriteTransaction,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let mut table = write_txn
            .open_table(self.seq_numbers())
            .map_err(redb_error)?;
        table
            .insert(SENDER, record.next_sender_seq_number)
            .map_err(redb_error)?;
        table
            .insert(TARGET, record.next_target_seq_number)
            .map_err(redb_error)?;
        table
            .insert(CREATION_TIME, to_micros(record.creation_time)?)
            .map_err(redb_error)?;
        table
            .insert(LAST_RESET_TIME, to_micros(record.last_reset_time)?)
            .map_err(redb_error)?;
        Ok(())
    }
}

fn to_micros(time: DateTime<Utc>) -> Result<u64, StoreError> {
    u64::try_from(time.timestamp_micros())
        .map_err(|_| StoreError::Corrupt(format!("timestamp {} predates the epoch", time)))
}

fn from_micros(micros: u64) -> Result<DateTime<Utc>, StoreError> {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp {}", micros)))
}

/// Commits a record in its own write transaction.
fn commit_record(db: &Database, tables: &Tables, record: &SessionRecord) -> Result<(), StoreError> {
    let write_txn = db.begin_write().map_err(redb_error)?;
    tables.write_record(&write_txn, record)?;
    write_txn.commit().map_err(redb_error)?;
    Ok(())
}

pub struct RedbMessageStore {
    db: Arc<Database>,
    tables: Tables,
    record: SessionRecord,
    operation_timeout: Duration,
}

impl RedbMessageStore {
    /// Applies `update` to the record read inside a write transaction and commits the result.
    async fn update_record<F>(&mut self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(SessionRecord) -> Result<SessionRecord, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        let tables = self.tables.clone();
        let cached = self.record;
        self.record = run_blocking(self.operation_timeout, move || {
            let write_txn = db.begin_write().map_err(redb_error)?;
            let current = tables.read_record_for_update(&write_txn)?.unwrap_or(cached);
            let record = update(current)?;
            tables.write_record(&write_txn, &record)?;
            write_txn.commit().map_err(redb_error)?;
            Ok(record)
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for RedbMessageStore {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        let sequence_number = check_sequence_number(sequence_number)?;
        let db = self.db.clone();
        let tables = self.tables.clone();
        let message = message.to_vec();
        run_blocking(self.operation_timeout, move || {
            let write_txn = db.begin_write().map_err(redb_error)?;
            {
                let mut table = write_txn.open_table(tables.messages()).map_err(redb_error)?;
                table
                    .insert(sequence_number, message.as_slice())
                    .map_err(redb_error)?;
            }
            write_txn.commit().map_err(redb_error)?;
            Ok(())
        })
        .await
    }

    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        if begin > end {
            return Ok(vec![]);
        }

        let db = self.db.clone();
        let tables = self.tables.clone();
        run_blocking(self.operation_timeout, move || {
            let read_txn = db.begin_read().map_err(redb_error)?;
            let table = match read_txn.open_table(tables.messages()) {
                Ok(table) => table,
                Err(TableDoesNotExist(_)) => return Ok(vec![]),
                Err(err) => return Err(redb_error(err)),
            };

            let mut messages = vec![];
            for entry in table.range(begin..=end).map_err(redb_error)? {
                let (_, message) = entry.map_err(redb_error)?;
                messages.push(message.value().to_vec());
            }
            Ok(messages)
        })
        .await
    }

    fn next_sender_seq_number(&self) -> u64 {
        self.record.next_sender_seq_number
    }

    fn next_target_seq_number(&self) -> u64 {
        self.record.next_target_seq_number
    }

    async fn set_next_sender_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        check_sequence_number(sequence_number)?;
        self.update_record(move |record| record.with_next_sender(sequence_number))
            .await
    }

    async fn set_next_target_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        check_sequence_number(sequence_number)?;
        self.update_record(move |record| record.with_next_target(sequence_number))
            .await
    }

    async fn increment_sender_seq_number(&mut self) -> Result<(), StoreError> {
        self.update_record(SessionRecord::increment_sender).await
    }

    async fn increment_target_seq_number(&mut self) -> Result<(), StoreError> {
        self.update_record(SessionRecord::increment_target).await
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        debug!(table = self.tables.messages.as_str(), "resetting redb store");
        let db = self.db.clone();
        let tables = self.tables.clone();
        let cached = self.record;
        self.record = run_blocking(self.operation_timeout, move || {
            let write_txn = db.begin_write().map_err(redb_error)?;
            let record = tables
                .read_record_for_update(&write_txn)?
                .unwrap_or(cached)
                .reset(now());
            write_txn
                .delete_table(tables.messages())
                .map_err(redb_error)?;
            tables.write_record(&write_txn, &record)?;
            write_txn.commit().map_err(redb_error)?;
            Ok(record)
        })
        .await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        let db = self.db.clone();
        let tables = self.tables.clone();
        let record = run_blocking(self.operation_timeout, move || tables.read_record(&db)).await?;
        match record {
            Some(record) => self.record = record,
            None => {
                // the session was never persisted, write what we hold
                self.update_record(Ok).await?;
            }
        }
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.record.creation_time
    }

    fn last_reset_time(&self) -> DateTime<Utc> {
        self.record.last_reset_time
    }
}

/// Opens redb stores, all sessions sharing one database file.
#[derive(Clone)]
pub struct RedbStoreFactory {
    db: Arc<Database>,
    operation_timeout: Duration,
}

impl RedbStoreFactory {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(redb_error)?;

        Ok(Self {
            db: Arc::new(db),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        })
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }
}

#[async_trait::async_trait]
impl StoreFactory for RedbStoreFactory {
    type Store = RedbMessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
        let db = self.db.clone();
        let tables = Tables::new(session_id);
        let record = run_blocking(self.operation_timeout, {
            let db = db.clone();
            let tables = tables.clone();
            move || match tables.read_record(&db)? {
                Some(record) => Ok(record),
                None => {
                    debug!(table = tables.seq_numbers.as_str(), "initialising new redb store");
                    let record = SessionRecord::new(now());
                    commit_record(&db, &tables, &record)?;
                    Ok(record)
                }
            }
        })
        .await?;

        Ok(RedbMessageStore {
            db,
            tables,
            record,
            operation_timeout: self.operation_timeout,
        })
    }
}
