//! Flat-file message store.
//!
//! Every session gets four files in the store directory, named after
//! [`SessionId::storage_key`]:
//!
//! - `.body` holds the raw messages back to back,
//! - `.header` holds one `sequence,offset,length` line per message (later lines win),
//! - `.seqnums` holds the next sender and target sequence numbers,
//! - `.session` holds the creation and last reset times, then a reset generation.
//!
//! The reset generation goes up by one on every reset. Readers compare it with the
//! generation their index was loaded at, since a reset followed by new writes can
//! leave the header exactly as long as before.
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
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

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H:%M:%S%.6f";

#[derive(Clone, Copy, Debug)]
struct Location {
    offset: u64,
    length: usize,
}

/// Contents of the `.session` file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SessionTimes {
    creation_time: DateTime<Utc>,
    last_reset_time: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug)]
struct SessionFiles {
    body: File,
    header: File,
    seqnums_path: PathBuf,
    session_path: PathBuf,
    index: BTreeMap<u64, Location>,
    header_length: u64,
    generation: u64,
}

/// Replacement files written next to their targets, renamed into place by `commit`.
struct Staged {
    renames: Vec<(PathBuf, PathBuf)>,
}

impl Staged {
    fn commit(self) -> Result<(), StoreError> {
        for (temporary, path) in self.renames {
            fs::rename(temporary, path)?;
        }
        Ok(())
    }
}

impl SessionFiles {
    fn open(directory: &Path, session_id: &SessionId) -> Result<(Self, SessionRecord), StoreError> {
        fs::create_dir_all(directory)?;
        let prefix = directory.join(session_id.storage_key());
        let with_extension = |extension: &str| {
            let mut path = prefix.clone().into_os_string();
            path.push(".");
            path.push(extension);
            PathBuf::from(path)
        };

        let open_log = |path: PathBuf| {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
        };

        let mut files = Self {
            body: open_log(with_extension("body"))?,
            header: open_log(with_extension("header"))?,
            seqnums_path: with_extension("seqnums"),
            session_path: with_extension("session"),
            index: BTreeMap::new(),
            header_length: 0,
            generation: 0,
        };

        if !files.session_path.exists() {
            debug!(%session_id, "initialising new file store");
            files.stage_record(&SessionRecord::new(now()), 0)?.commit()?;
        }
        files.load_index()?;
        let record = files.read_record()?;

        Ok((files, record))
    }

    fn load_index(&mut self) -> Result<(), StoreError> {
        // read before the header, so a reset racing with this load is seen by the next check
        let generation = self.read_session()?.generation;

        let mut contents = String::new();
        self.header.seek(SeekFrom::Start(0))?;
        self.header.read_to_string(&mut contents)?;

        let mut index = BTreeMap::new();
        for line in contents.lines().filter(|line| !line.is_empty()) {
            let (sequence_number, location) = parse_header_line(line)?;
            index.insert(sequence_number, location);
        }

        self.index = index;
        self.header_length = contents.len() as u64;
        self.generation = generation;
        Ok(())
    }

    /// Picks up messages written or reset through another store for the same session.
    fn reload_index_if_changed(&mut self) -> Result<(), StoreError> {
        let header_length = self.header.metadata()?.len();
        let generation = self.read_session()?.generation;
        if header_length != self.header_length || generation != self.generation {
            debug!(generation, "message index changed on disk, reloading");
            self.load_index()?;
        }
        Ok(())
    }

    fn append(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        let offset = self.body.metadata()?.len();
        self.body.write_all(message)?;

        let line = format!("{},{},{}\n", sequence_number, offset, message.len());
        self.header.write_all(line.as_bytes())?;
        self.header_length += line.len() as u64;

        self.index.insert(
            sequence_number,
            Location {
                offset,
                length: message.len(),
            },
        );
        Ok(())
    }

    fn read_range(&mut self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        let locations: Vec<Location> = self
            .index
            .range(begin..=end)
            .map(|(_, location)| *location)
            .collect();

        let mut messages = Vec::with_capacity(locations.len());
        for location in locations {
            let mut message = vec![0; location.length];
            self.body.seek(SeekFrom::Start(location.offset))?;
            self.body.read_exact(&mut message)?;
            messages.push(message);
        }

        Ok(messages)
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        self.header.set_len(0)?;
        self.body.set_len(0)?;
        self.index.clear();
        self.header_length = 0;
        Ok(())
    }

    fn read_session(&self) -> Result<SessionTimes, StoreError> {
        parse_session(&fs::read_to_string(&self.session_path)?)
    }

    fn read_record(&self) -> Result<SessionRecord, StoreError> {
        let session = self.read_session()?;
        let (next_sender_seq_number, next_target_seq_number) = if self.seqnums_path.exists() {
            parse_seqnums(&fs::read_to_string(&self.seqnums_path)?)?
        } else {
            warn!(path = %self.seqnums_path.display(), "sequence number file is missing, starting from 1");
            (1, 1)
        };

        Ok(SessionRecord {
            next_sender_seq_number,
            next_target_seq_number,
            creation_time: session.creation_time,
            last_reset_time: session.last_reset_time,
        })
    }

    /// Writes the replacement `.seqnums` and `.session` files without touching the live ones.
    fn stage_record(&self, record: &SessionRecord, generation: u64) -> Result<Staged, StoreError> {
        let session = format!(
            "{}\n{}\n{}\n",
            record.creation_time.format(TIMESTAMP_FORMAT),
            record.last_reset_time.format(TIMESTAMP_FORMAT),
            generation
        );

        Ok(Staged {
            renames: vec![
                stage_file(&self.seqnums_path, &format_seqnums(record))?,
                stage_file(&self.session_path, &session)?,
            ],
        })
    }

    fn write_seqnums(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let (temporary, path) = stage_file(&self.seqnums_path, &format_seqnums(record))?;
        fs::rename(temporary, path)?;
        Ok(())
    }

    /// Resets the session on disk, returning the new record.
    ///
    /// Replacement counter files are staged before the messages are truncated, so a
    /// failure to write them leaves the old messages and counters in place.
    fn reset(&mut self) -> Result<SessionRecord, StoreError> {
        let record = self.read_record()?.reset(now());
        let generation = self.read_session()?.generation.wrapping_add(1);

        let staged = self.stage_record(&record, generation)?;
        self.truncate()?;
        staged.commit()?;
        self.generation = generation;

        Ok(record)
    }
}

fn format_seqnums(record: &SessionRecord) -> String {
    format!(
        "{:010} : {:010}",
        record.next_sender_seq_number, record.next_target_seq_number
    )
}

fn stage_file(path: &Path, contents: &str) -> Result<(PathBuf, PathBuf), StoreError> {
    let mut temporary = path.to_path_buf().into_os_string();
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);

    let mut file = File::create(&temporary)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok((temporary, path.to_path_buf()))
}

fn parse_header_line(line: &str) -> Result<(u64, Location), StoreError> {
    let corrupt = || StoreError::Corrupt(format!("invalid header line '{}'", line));
    let mut fields = line.split(',').map(|field| field.trim().parse::<u64>());

    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(Ok(sequence_number)), Some(Ok(offset)), Some(Ok(length)), None) => {
            let length = usize::try_from(length).map_err(|_| corrupt())?;
            Ok((sequence_number, Location { offset, length }))
        }
        _ => Err(corrupt()),
    }
}

fn parse_seqnums(contents: &str) -> Result<(u64, u64), StoreError> {
    let corrupt = || StoreError::Corrupt(format!("invalid sequence numbers '{}'", contents));
    let (sender, target) = contents.split_once(':').ok_or_else(corrupt)?;
    let sender: u64 = sender.trim().parse().map_err(|_| corrupt())?;
    let target: u64 = target.trim().parse().map_err(|_| corrupt())?;

    let sender = check_sequence_number(sender).map_err(|_| corrupt())?;
    let target = check_sequence_number(target).map_err(|_| corrupt())?;
    Ok((sender, target))
}

fn parse_session(contents: &str) -> Result<SessionTimes, StoreError> {
    let mut lines = contents.lines();
    let creation_time = parse_timestamp(lines.next())?;
    let last_reset_time = parse_timestamp(lines.next())?;
    // files written before generations were kept have none
    let generation: u64 = match lines.next().map(str::trim).filter(|line| !line.is_empty()) {
        Some(line) => line.parse().map_err(|_| {
            StoreError::Corrupt(format!("invalid reset generation '{}'", line))
        })?,
        None => 0,
    };

    Ok(SessionTimes {
        creation_time,
        last_reset_time,
        generation,
    })
}

fn parse_timestamp(line: Option<&str>) -> Result<DateTime<Utc>, StoreError> {
    let line = line
        .map(str::trim)
        .ok_or_else(|| StoreError::Corrupt("session file is missing a timestamp".to_string()))?;
    let naive = NaiveDateTime::parse_from_str(line, "%Y%m%d-%H:%M:%S%.f")
        .map_err(|err| StoreError::Corrupt(format!("invalid timestamp '{}': {}", line, err)))?;

    Ok(Utc.from_utc_datetime(&naive))
}

fn lock(files: &Mutex<SessionFiles>) -> Result<MutexGuard<'_, SessionFiles>, StoreError> {
    files
        .lock()
        .map_err(|_| StoreError::Unavailable("file store lock is poisoned".to_string()))
}

pub struct FileMessageStore {
    session_id: SessionId,
    files: Arc<Mutex<SessionFiles>>,
    record: SessionRecord,
    operation_timeout: Duration,
}

impl FileMessageStore {
    /// Applies `update` to the counters read back from disk and writes the result.
    async fn update_seqnums<F>(&mut self, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(SessionRecord) -> Result<SessionRecord, StoreError> + Send + 'static,
    {
        let files = self.files.clone();
        self.record = run_blocking(self.operation_timeout, move || {
            let files = lock(&files)?;
            let record = update(files.read_record()?)?;
            files.write_seqnums(&record)?;
            Ok(record)
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for FileMessageStore {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        let sequence_number = check_sequence_number(sequence_number)?;
        let files = self.files.clone();
        let message = message.to_vec();
        run_blocking(self.operation_timeout, move || {
            let mut files = lock(&files)?;
            files.append(sequence_number, &message)
        })
        .await
    }

    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        if begin > end {
            return Ok(vec![]);
        }

        let files = self.files.clone();
        run_blocking(self.operation_timeout, move || {
            let mut files = lock(&files)?;
            files.reload_index_if_changed()?;
            files.read_range(begin, end)
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
        self.update_seqnums(move |record| record.with_next_sender(sequence_number))
            .await
    }

    async fn set_next_target_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        check_sequence_number(sequence_number)?;
        self.update_seqnums(move |record| record.with_next_target(sequence_number))
            .await
    }

    async fn increment_sender_seq_number(&mut self) -> Result<(), StoreError> {
        self.update_seqnums(SessionRecord::increment_sender).await
    }

    async fn increment_target_seq_number(&mut self) -> Result<(), StoreError> {
        self.update_seqnums(SessionRecord::increment_target).await
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        debug!(session_id = %self.session_id, "resetting file store");
        let files = self.files.clone();
        self.record = run_blocking(self.operation_timeout, move || {
            let mut files = lock(&files)?;
            files.reset()
        })
        .await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        let files = self.files.clone();
        self.record = run_blocking(self.operation_timeout, move || {
            let mut files = lock(&files)?;
            files.load_index()?;
            files.read_record()
        })
        .await?;
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.record.creation_time
    }

    fn last_reset_time(&self) -> DateTime<Utc> {
        self.record.last_reset_time
    }
}

/// Opens file stores inside one directory.
#[derive(Clone, Debug)]
pub struct FileStoreFactory {
    directory: PathBuf,
    operation_timeout: Duration,
}

impl FileStoreFactory {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }
}

#[async_trait::async_trait]
impl StoreFactory for FileStoreFactory {
    type Store = FileMessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
        let directory = self.directory.clone();
        let id = session_id.clone();
        let (files, record) =
            run_blocking(self.operation_timeout, move || SessionFiles::open(&directory, &id))
                .await?;

        Ok(FileMessageStore {
            session_id: session_id.clone(),
            files: Arc::new(Mutex::new(files)),
            record,
            operation_timeout: self.operation_timeout,
        })
    }

    async fn destroy(&self, store: Self::Store) -> Result<(), StoreError> {
        debug!(session_id = %store.session_id, "closing file store");
        drop(store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::error::StoreError;
    use crate::session_id::SessionId;
    use crate::store::file::{
        parse_header_line, parse_seqnums, parse_session, parse_timestamp, FileStoreFactory,
    };
    use crate::store::{MessageStore, StoreFactory};

    #[test]
    fn test_header_line() {
        let (sequence_number, location) = parse_header_line("12,3400,77").unwrap();
        assert_eq!(sequence_number, 12);
        assert_eq!(location.offset, 3400);
        assert_eq!(location.length, 77);
    }

    #[test]
    fn test_malformed_header_lines() {
        for line in ["12,3400", "12,3400,77,1", "a,b,c", "12,-1,77"] {
            assert!(
                matches!(parse_header_line(line), Err(StoreError::Corrupt(_))),
                "{} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_seqnums() {
        assert_eq!(parse_seqnums("0000000004 : 0000000017").unwrap(), (4, 17));
        assert!(matches!(
            parse_seqnums("0000000000 : 0000000001"),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(parse_seqnums("garbage"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_timestamp() {
        let parsed = parse_timestamp(Some("20230908-08:24:56.574000")).unwrap();
        let expected = Utc.with_ymd_and_hms(2023, 9, 8, 8, 24, 56).unwrap()
            + chrono::Duration::milliseconds(574);
        assert_eq!(parsed, expected);

        assert!(matches!(parse_timestamp(None), Err(StoreError::Corrupt(_))));
        assert!(matches!(
            parse_timestamp(Some("08:24:56")),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_session_file() {
        let session = parse_session("20230908-08:24:56.574000\n20230909-00:00:00.000000\n3\n").unwrap();
        assert_eq!(session.generation, 3);
        assert_eq!(
            session.last_reset_time,
            Utc.with_ymd_and_hms(2023, 9, 9, 0, 0, 0).unwrap()
        );

        let without_generation =
            parse_session("20230908-08:24:56.574000\n20230909-00:00:00.000000\n").unwrap();
        assert_eq!(without_generation.generation, 0);

        assert!(matches!(
            parse_session("20230908-08:24:56.574000\n20230909-00:00:00.000000\nlots\n"),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_timed_out_reset_is_not_undone_by_later_writes() {
        let directory = tempfile::tempdir().unwrap();
        let factory = FileStoreFactory::new(directory.path());
        let session_id = SessionId::new("FIX.4.4", "SENDER", "TARGET");
        let mut store = factory.create(&session_id).await.unwrap();
        store.add(1, b"A").await.unwrap();
        store.set_next_sender_seq_number(10).await.unwrap();

        let (locked, wait_for_lock) = mpsc::channel();
        let files = store.files.clone();
        let holder = std::thread::spawn(move || {
            let _files = files.lock().unwrap();
            locked.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(150));
        });
        wait_for_lock.recv().unwrap();

        store.operation_timeout = Duration::from_millis(50);
        assert!(matches!(store.reset().await, Err(StoreError::Unavailable(_))));
        store.operation_timeout = Duration::from_secs(5);
        holder.join().unwrap();

        // the abandoned reset still runs once the lock is free
        for _ in 0..100 {
            let fresh = factory.create(&session_id).await.unwrap();
            if fresh.next_sender_seq_number() == 1 {
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
