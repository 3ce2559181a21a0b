//! Message stores for the HotFIX engine.
//!
//! A [`MessageStore`](store::MessageStore) keeps the messages a session sent, so they
//! can be replayed on a resend request, together with the session's sequence numbers.
//! [`StoreFactory`](store::StoreFactory) implementations open stores per session for
//! each backend, and [`contract`] holds the checks every backend is held to.
pub mod config;
pub mod contract;
pub mod error;
mod session_id;
pub mod store;

pub use error::StoreError;
pub use session_id::SessionId;
pub use store::any::{AnyMessageStore, AnyStoreFactory};
pub use store::{MessageStore, SessionRecord, StoreFactory, MAX_SEQUENCE_NUMBER};
