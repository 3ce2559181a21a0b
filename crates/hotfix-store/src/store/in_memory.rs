use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::StoreError;
use crate::session_id::SessionId;
use crate::store::{check_sequence_number, now, MessageStore, SessionRecord, StoreFactory};

#[derive(Debug)]
struct State {
    record: SessionRecord,
    messages: BTreeMap<u64, Vec<u8>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            record: SessionRecord::new(now()),
            messages: BTreeMap::new(),
        }
    }
}

/// Keeps everything in process memory.
///
/// Stores handed out by the same [`InMemoryStoreFactory`] for a session share their state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryMessageStore {
    fn state(&self) -> MutexGuard<'_, State> {
        // no operation leaves the state half-updated, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        let sequence_number = check_sequence_number(sequence_number)?;
        self.state()
            .messages
            .insert(sequence_number, message.to_vec());
        Ok(())
    }

    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        if begin > end {
            return Ok(vec![]);
        }

        Ok(self
            .state()
            .messages
            .range(begin..=end)
            .map(|(_, message)| message.clone())
            .collect())
    }

    fn next_sender_seq_number(&self) -> u64 {
        self.state().record.next_sender_seq_number
    }

    fn next_target_seq_number(&self) -> u64 {
        self.state().record.next_target_seq_number
    }

    async fn set_next_sender_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.record = state.record.with_next_sender(sequence_number)?;
        Ok(())
    }

    async fn set_next_target_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.record = state.record.with_next_target(sequence_number)?;
        Ok(())
    }

    async fn increment_sender_seq_number(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.record = state.record.increment_sender()?;
        Ok(())
    }

    async fn increment_target_seq_number(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.record = state.record.increment_target()?;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.record = state.record.reset(now());
        state.messages.clear();
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        // the shared state is the source of truth, there is nothing to reload
        Ok(())
    }

    fn creation_time(&self) -> DateTime<Utc> {
        self.state().record.creation_time
    }

    fn last_reset_time(&self) -> DateTime<Utc> {
        self.state().record.last_reset_time
    }
}

/// Hands out in-memory stores, one shared state per session.
///
/// State lives as long as the factory, so dropping a store and creating it again
/// gives back the same messages and sequence numbers.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStoreFactory {
    sessions: Arc<Mutex<HashMap<SessionId, InMemoryMessageStore>>>,
}

#[async_trait::async_trait]
impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryMessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let store = sessions.entry(session_id.clone()).or_insert_with(|| {
            debug!(%session_id, "creating in-memory store");
            InMemoryMessageStore::default()
        });

        Ok(store.clone())
    }
}
