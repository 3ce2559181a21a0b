//! SQLite-backed message store.
//!
//! Sessions live in a `sessions` table keyed by the session identity, messages in a
//! `messages` table keyed by the session identity and sequence number.
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::session_id::SessionId;
use crate::store::{
    check_sequence_number, now, run_blocking, MessageStore, SessionRecord, StoreFactory,
    DEFAULT_OPERATION_TIMEOUT,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sessions (
        beginstring TEXT NOT NULL,
        sendercompid TEXT NOT NULL,
        targetcompid TEXT NOT NULL,
        session_qualifier TEXT NOT NULL,
        creation_time TEXT NOT NULL,
        last_reset_time TEXT NOT NULL,
        incoming_seqnum INTEGER NOT NULL,
        outgoing_seqnum INTEGER NOT NULL,
        PRIMARY KEY (beginstring, sendercompid, targetcompid, session_qualifier)
    );
    CREATE TABLE IF NOT EXISTS messages (
        beginstring TEXT NOT NULL,
        sendercompid TEXT NOT NULL,
        targetcompid TEXT NOT NULL,
        session_qualifier TEXT NOT NULL,
        msgseqnum INTEGER NOT NULL,
        message BLOB NOT NULL,
        stored_at TEXT NOT NULL,
        PRIMARY KEY (beginstring, sendercompid, targetcompid, session_qualifier, msgseqnum)
    );
"#;

const SESSION_KEY: &str =
    "beginstring = ?1 AND sendercompid = ?2 AND targetcompid = ?3 AND session_qualifier = ?4";

fn to_sql_seq(sequence_number: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence_number).map_err(|_| StoreError::InvalidSequenceNumber(sequence_number))
}

fn from_sql_seq(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .ok()
        .filter(|sequence_number| *sequence_number > 0)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid stored sequence number {}", value)))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid timestamp '{}': {}", value, err)))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Unavailable("sqlite connection lock is poisoned".to_string()))
}

fn read_record(conn: &Connection, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
    let query = format!(
        "SELECT creation_time, last_reset_time, incoming_seqnum, outgoing_seqnum
         FROM sessions WHERE {}",
        SESSION_KEY
    );
    let row = conn
        .query_row(&query, session_params(session_id), |row: &Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .optional()?;

    row.map(|(creation_time, last_reset_time, incoming, outgoing)| {
        Ok(SessionRecord {
            next_sender_seq_number: from_sql_seq(outgoing)?,
            next_target_seq_number: from_sql_seq(incoming)?,
            creation_time: parse_time(&creation_time)?,
            last_reset_time: parse_time(&last_reset_time)?,
        })
    })
    .transpose()
}

fn write_record(
    conn: &Connection,
    session_id: &SessionId,
    record: &SessionRecord,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sessions (beginstring, sendercompid, targetcompid, session_qualifier,
                               creation_time, last_reset_time, incoming_seqnum, outgoing_seqnum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (beginstring, sendercompid, targetcompid, session_qualifier) DO UPDATE SET
             creation_time = excluded.creation_time,
             last_reset_time = excluded.last_reset_time,
             incoming_seqnum = excluded.incoming_seqnum,
             outgoing_seqnum = excluded.outgoing_seqnum",
        params![
            session_id.begin_string,
            session_id.sender_comp_id,
            session_id.target_comp_id,
            session_id.qualifier(),
            record.creation_time.to_rfc3339(),
            record.last_reset_time.to_rfc3339(),
            to_sql_seq(record.next_target_seq_number)?,
            to_sql_seq(record.next_sender_seq_number)?,
        ],
    )?;
    Ok(())
}

fn session_params(session_id: &SessionId) -> [&str; 4] {
    [
        session_id.begin_string.as_str(),
        session_id.sender_comp_id.as_str(),
        session_id.target_comp_id.as_str(),
        session_id.qualifier(),
    ]
}

pub struct SqliteMessageStore {
    session_id: SessionId,
    conn: Arc<Mutex<Connection>>,
    record: SessionRecord,
    operation_timeout: Duration,
}

impl SqliteMessageStore {
    /// Applies `update` to the session row inside one immediate transaction.
    async fn update_record<F>(&mut self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(SessionRecord) -> Result<SessionRecord, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let session_id = self.session_id.clone();
        let cached = self.record;
        self.record = run_blocking(self.operation_timeout, move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let record = update(read_record(&tx, &session_id)?.unwrap_or(cached))?;
            write_record(&tx, &session_id, &record)?;
            tx.commit()?;
            Ok(record)
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for SqliteMessageStore {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        let sequence_number = to_sql_seq(check_sequence_number(sequence_number)?)?;
        let conn = self.conn.clone();
        let session_id = self.session_id.clone();
        let message = message.to_vec();
        run_blocking(self.operation_timeout, move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO messages (beginstring, sendercompid, targetcompid, session_qualifier,
                                       msgseqnum, message, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (beginstring, sendercompid, targetcompid, session_qualifier, msgseqnum)
                 DO UPDATE SET message = excluded.message, stored_at = excluded.stored_at",
                params![
                    session_id.begin_string,
                    session_id.sender_comp_id,
                    session_id.target_comp_id,
                    session_id.qualifier(),
                    sequence_number,
                    message,
                    now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        if begin > end {
            return Ok(vec![]);
        }

        // anything past i64::MAX can't be stored, so clamping keeps the range intact
        let begin = i64::try_from(begin).unwrap_or(i64::MAX);
        let end = i64::try_from(end).unwrap_or(i64::MAX);
        let conn = self.conn.clone();
        let session_id = self.session_id.clone();
        run_blocking(self.operation_timeout, move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT message FROM messages WHERE {} AND msgseqnum BETWEEN ?5 AND ?6
                 ORDER BY msgseqnum",
                SESSION_KEY
            ))?;
            let [begin_string, sender_comp_id, target_comp_id, qualifier] =
                session_params(&session_id);
            let messages = stmt
                .query_map(
                    params![begin_string, sender_comp_id, target_comp_id, qualifier, begin, end],
                    |row| row.get::<_, Vec<u8>>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
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
        debug!(session_id = %self.session_id, "resetting sqlite store");
        let conn = self.conn.clone();
        let session_id = self.session_id.clone();
        let cached = self.record;
        self.record = run_blocking(self.operation_timeout, move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let record = read_record(&tx, &session_id)?
                .unwrap_or(cached)
                .reset(now());
            tx.execute(
                &format!("DELETE FROM messages WHERE {}", SESSION_KEY),
                session_params(&session_id),
            )?;
            write_record(&tx, &session_id, &record)?;
            tx.commit()?;
            Ok(record)
        })
        .await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let session_id = self.session_id.clone();
        let record = run_blocking(self.operation_timeout, move || {
            let conn = lock(&conn)?;
            read_record(&conn, &session_id)
        })
        .await?;

        match record {
            Some(record) => self.record = record,
            None => {
                warn!(session_id = %self.session_id, "session row disappeared, writing it back");
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

/// Opens one SQLite connection per store, all against the same database file.
#[derive(Clone, Debug)]
pub struct SqliteStoreFactory {
    path: PathBuf,
    operation_timeout: Duration,
}

impl SqliteStoreFactory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }
}

#[async_trait::async_trait]
impl StoreFactory for SqliteStoreFactory {
    type Store = SqliteMessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
        let path = self.path.clone();
        let id = session_id.clone();
        let operation_timeout = self.operation_timeout;
        let (conn, record) = run_blocking(operation_timeout, move || {
            let mut conn = Connection::open(&path)?;
            conn.busy_timeout(operation_timeout)?;
            conn.execute_batch(SCHEMA)?;

            let tx = conn.transaction()?;
            let record = match read_record(&tx, &id)? {
                Some(record) => record,
                None => {
                    debug!(session_id = %id, "initialising new sqlite store");
                    let record = SessionRecord::new(now());
                    write_record(&tx, &id, &record)?;
                    record
                }
            };
            tx.commit()?;

            Ok((conn, record))
        })
        .await?;

        Ok(SqliteMessageStore {
            session_id: session_id.clone(),
            conn: Arc::new(Mutex::new(conn)),
            record,
            operation_timeout,
        })
    }

    async fn destroy(&self, store: Self::Store) -> Result<(), StoreError> {
        debug!(session_id = %store.session_id, "closing sqlite store");
        // a timed out operation may still hold the connection, it closes once that finishes
        if let Ok(conn) = Arc::try_unwrap(store.conn) {
            let conn = conn
                .into_inner()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock is poisoned".to_string()))?;
            conn.close().map_err(|(_, err)| StoreError::Database(err))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::error::StoreError;
    use crate::session_id::SessionId;
    use crate::store::sqlite::{from_sql_seq, parse_time, to_sql_seq, SqliteStoreFactory};
    use crate::store::{MessageStore, StoreFactory};

    #[test]
    fn test_sequence_numbers_fit_sqlite_integers() {
        assert_eq!(to_sql_seq(42).unwrap(), 42);
        assert!(matches!(
            to_sql_seq(u64::MAX),
            Err(StoreError::InvalidSequenceNumber(u64::MAX))
        ));
        assert_eq!(from_sql_seq(42).unwrap(), 42);
        assert!(matches!(from_sql_seq(0), Err(StoreError::Corrupt(_))));
        assert!(matches!(from_sql_seq(-3), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_parse_time() {
        let time = parse_time("2023-09-08T08:24:56.574123+00:00").unwrap();
        assert_eq!(time.to_rfc3339(), "2023-09-08T08:24:56.574123+00:00");
        assert!(matches!(parse_time("yesterday"), Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_timed_out_reset_is_not_undone_by_later_writes() {
        let directory = tempfile::tempdir().unwrap();
        let factory = SqliteStoreFactory::new(directory.path().join("store.db"));
        let session_id = SessionId::new("FIX.4.4", "SENDER", "TARGET");
        let mut store = factory.create(&session_id).await.unwrap();
        store.add(1, b"A").await.unwrap();
        store.set_next_sender_seq_number(10).await.unwrap();

        let (locked, wait_for_lock) = mpsc::channel();
        let conn = store.conn.clone();
        let holder = std::thread::spawn(move || {
            let _conn = conn.lock().unwrap();
            locked.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(150));
        });
        wait_for_lock.recv().unwrap();

        store.operation_timeout = Duration::from_millis(50);
        assert!(matches!(store.reset().await, Err(StoreError::Unavailable(_))));
        store.operation_timeout = Duration::from_secs(5);
        holder.join().unwrap();

        // the abandoned reset still runs once the connection is free
        for _ in 0..100 {
            let fresh = factory.create(&session_id).await.unwrap();
            let reset = fresh.next_sender_seq_number() == 1;
            factory.destroy(fresh).await.unwrap();
            if reset {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        store.increment_sender_seq_number().await.unwrap();
        assert_eq!(store.next_sender_seq_number(), 2);

        let reopened = factory.create(&session_id).await.unwrap();
        assert!(reopened.get_slice(1, u64::MAX).await.unwrap().is_empty());
        assert_eq!(reopened.next_sender_seq_number(), 2);
    }
}
