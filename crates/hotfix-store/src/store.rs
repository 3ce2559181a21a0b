pub mod any;
pub mod file;
pub mod in_memory;
#[cfg(feature = "redb")]
pub mod redb;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{DateTime, SubsecRound, Utc};
use std::time::Duration;

use crate::error::StoreError;
use crate::session_id::SessionId;

/// Timeout applied to blocking backend operations unless configured otherwise.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest sequence number any backend accepts, bounded by SQL integer columns.
pub const MAX_SEQUENCE_NUMBER: u64 = i64::MAX as u64;

/// Durable record of the messages we sent in a session and its sequence numbers.
///
/// Stored messages are the ones replayed when the counterparty sends a resend request.
/// Adding a message under a sequence number that is already taken overwrites it.
/// Counters and messages are independent here. Keeping `next_sender_seq_number`
/// one ahead of the last stored message is up to the session.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError>;

    /// Returns the messages stored in `begin..=end` in ascending order.
    ///
    /// Sequence numbers with no stored message are skipped, so callers detect gaps
    /// themselves. Pass `u64::MAX` as `end` to read up to the last message.
    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError>;

    fn next_sender_seq_number(&self) -> u64;

    fn next_target_seq_number(&self) -> u64;

    async fn set_next_sender_seq_number(&mut self, sequence_number: u64)
        -> Result<(), StoreError>;

    async fn set_next_target_seq_number(&mut self, sequence_number: u64)
        -> Result<(), StoreError>;

    async fn increment_sender_seq_number(&mut self) -> Result<(), StoreError>;

    async fn increment_target_seq_number(&mut self) -> Result<(), StoreError>;

    /// Drops all messages and starts both sequences from 1 again.
    async fn reset(&mut self) -> Result<(), StoreError>;

    /// Reloads cached sequence numbers from the backing medium.
    async fn refresh(&mut self) -> Result<(), StoreError>;

    fn creation_time(&self) -> DateTime<Utc>;

    fn last_reset_time(&self) -> DateTime<Utc>;
}

/// Opens message stores for sessions.
///
/// Stores created for the same session share their backing storage.
#[async_trait::async_trait]
pub trait StoreFactory: Send + Sync {
    type Store: MessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError>;

    /// Releases the store's handles. Stored data is left in place.
    async fn destroy(&self, store: Self::Store) -> Result<(), StoreError> {
        drop(store);
        Ok(())
    }
}

/// Header data kept for every session next to its messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub next_sender_seq_number: u64,
    pub next_target_seq_number: u64,
    pub creation_time: DateTime<Utc>,
    pub last_reset_time: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            next_sender_seq_number: 1,
            next_target_seq_number: 1,
            creation_time: now,
            last_reset_time: now,
        }
    }

    /// The record after a reset: sequences restart, the creation time is kept.
    pub fn reset(&self, now: DateTime<Utc>) -> Self {
        Self {
            creation_time: self.creation_time,
            ..Self::new(now)
        }
    }

    pub fn with_next_sender(self, sequence_number: u64) -> Result<Self, StoreError> {
        Ok(Self {
            next_sender_seq_number: check_sequence_number(sequence_number)?,
            ..self
        })
    }

    pub fn with_next_target(self, sequence_number: u64) -> Result<Self, StoreError> {
        Ok(Self {
            next_target_seq_number: check_sequence_number(sequence_number)?,
            ..self
        })
    }

    /// Fails with [`StoreError::InvalidSequenceNumber`] once the counter is at
    /// [`MAX_SEQUENCE_NUMBER`], leaving it unchanged.
    pub fn increment_sender(self) -> Result<Self, StoreError> {
        self.with_next_sender(self.next_sender_seq_number.saturating_add(1))
    }

    pub fn increment_target(self) -> Result<Self, StoreError> {
        self.with_next_target(self.next_target_seq_number.saturating_add(1))
    }
}

/// Current time, truncated to microseconds so every backend persists it exactly.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn check_sequence_number(sequence_number: u64) -> Result<u64, StoreError> {
    if sequence_number == 0 || sequence_number > MAX_SEQUENCE_NUMBER {
        Err(StoreError::InvalidSequenceNumber(sequence_number))
    } else {
        Ok(sequence_number)
    }
}

/// Runs blocking backend work off the async runtime, bounded by `timeout`.
///
/// A timed out task is not cancelled and may still commit. Callers must not derive
/// later writes from state cached before the call, so durable backends re-read
/// their record inside every mutation.
pub(crate) async fn run_blocking<T, F>(timeout: Duration, work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StoreError::Unavailable(format!(
            "store operation failed to complete: {}",
            join_error
        ))),
        Err(_) => Err(StoreError::timed_out(timeout)),
    }
}
