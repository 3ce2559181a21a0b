//! Backend chosen at runtime from [`StoreConfig`].
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{Backend, StoreConfig};
use crate::error::StoreError;
use crate::session_id::SessionId;
use crate::store::file::{FileMessageStore, FileStoreFactory};
use crate::store::in_memory::{InMemoryMessageStore, InMemoryStoreFactory};
#[cfg(feature = "redb")]
use crate::store::redb::{RedbMessageStore, RedbStoreFactory};
#[cfg(feature = "sqlite")]
use crate::store::sqlite::{SqliteMessageStore, SqliteStoreFactory};
use crate::store::{MessageStore, StoreFactory};

pub enum AnyMessageStore {
    InMemory(InMemoryMessageStore),
    File(FileMessageStore),
    #[cfg(feature = "redb")]
    Redb(RedbMessageStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteMessageStore),
}

macro_rules! dispatch {
    ($store:expr, $inner:ident => $body:expr) => {
        match $store {
            AnyMessageStore::InMemory($inner) => $body,
            AnyMessageStore::File($inner) => $body,
            #[cfg(feature = "redb")]
            AnyMessageStore::Redb($inner) => $body,
            #[cfg(feature = "sqlite")]
            AnyMessageStore::Sqlite($inner) => $body,
        }
    };
}

#[async_trait::async_trait]
impl MessageStore for AnyMessageStore {
    async fn add(&mut self, sequence_number: u64, message: &[u8]) -> Result<(), StoreError> {
        dispatch!(self, store => store.add(sequence_number, message).await)
    }

    async fn get_slice(&self, begin: u64, end: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        dispatch!(self, store => store.get_slice(begin, end).await)
    }

    fn next_sender_seq_number(&self) -> u64 {
        dispatch!(self, store => store.next_sender_seq_number())
    }

    fn next_target_seq_number(&self) -> u64 {
        dispatch!(self, store => store.next_target_seq_number())
    }

    async fn set_next_sender_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        dispatch!(self, store => store.set_next_sender_seq_number(sequence_number).await)
    }

    async fn set_next_target_seq_number(
        &mut self,
        sequence_number: u64,
    ) -> Result<(), StoreError> {
        dispatch!(self, store => store.set_next_target_seq_number(sequence_number).await)
    }

    async fn increment_sender_seq_number(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.increment_sender_seq_number().await)
    }

    async fn increment_target_seq_number(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.increment_target_seq_number().await)
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.reset().await)
    }

    async fn refresh(&mut self) -> Result<(), StoreError> {
        dispatch!(self, store => store.refresh().await)
    }

    fn creation_time(&self) -> DateTime<Utc> {
        dispatch!(self, store => store.creation_time())
    }

    fn last_reset_time(&self) -> DateTime<Utc> {
        dispatch!(self, store => store.last_reset_time())
    }
}

pub enum AnyStoreFactory {
    InMemory(InMemoryStoreFactory),
    File(FileStoreFactory),
    #[cfg(feature = "redb")]
    Redb(RedbStoreFactory),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStoreFactory),
}

impl AnyStoreFactory {
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        info!(backend = ?config.backend, path = ?config.path, "opening message store");
        let timeout = config.operation_timeout();
        let factory = match config.backend {
            Backend::InMemory => Self::InMemory(InMemoryStoreFactory::default()),
            Backend::File => Self::File(
                FileStoreFactory::new(config.required_path()?).with_operation_timeout(timeout),
            ),
            #[cfg(feature = "redb")]
            Backend::Redb => Self::Redb(
                RedbStoreFactory::new(config.required_path()?)?.with_operation_timeout(timeout),
            ),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite => Self::Sqlite(
                SqliteStoreFactory::new(config.required_path()?).with_operation_timeout(timeout),
            ),
            #[allow(unreachable_patterns)]
            backend => {
                return Err(StoreError::Config(format!(
                    "the {:?} backend is not enabled in this build",
                    backend
                )))
            }
        };

        Ok(factory)
    }
}

#[async_trait::async_trait]
impl StoreFactory for AnyStoreFactory {
    type Store = AnyMessageStore;

    async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
        let store = match self {
            Self::InMemory(factory) => AnyMessageStore::InMemory(factory.create(session_id).await?),
            Self::File(factory) => AnyMessageStore::File(factory.create(session_id).await?),
            #[cfg(feature = "redb")]
            Self::Redb(factory) => AnyMessageStore::Redb(factory.create(session_id).await?),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(factory) => AnyMessageStore::Sqlite(factory.create(session_id).await?),
        };

        Ok(store)
    }

    async fn destroy(&self, store: Self::Store) -> Result<(), StoreError> {
        match (self, store) {
            (Self::InMemory(factory), AnyMessageStore::InMemory(store)) => {
                factory.destroy(store).await
            }
            (Self::File(factory), AnyMessageStore::File(store)) => factory.destroy(store).await,
            #[cfg(feature = "redb")]
            (Self::Redb(factory), AnyMessageStore::Redb(store)) => factory.destroy(store).await,
            #[cfg(feature = "sqlite")]
            (Self::Sqlite(factory), AnyMessageStore::Sqlite(store)) => {
                factory.destroy(store).await
            }
            #[allow(unreachable_patterns)]
            (_, store) => {
                // a store from another backend still owns its handles, dropping releases them
                drop(store);
                Err(StoreError::Config(
                    "store was not created by this factory".to_string(),
                ))
            }
        }
    }
}
