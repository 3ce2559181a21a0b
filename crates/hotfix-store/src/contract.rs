//! Behavioural checks every [`MessageStore`] backend has to pass.
//!
//! Each case takes the factory under test, opens a fresh store for
//! [`contract_session_id`] (creating it and resetting whatever an earlier run left
//! behind), checks one part of the contract and hands the store back to
//! [`StoreFactory::destroy`]. The store is destroyed even when a check fails; the
//! failure is re-raised afterwards.
//!
//! Use [`message_store_contract_tests!`](crate::message_store_contract_tests) to
//! generate one test per case for a backend.
use futures::FutureExt;
use std::any::Any;
use std::panic::{resume_unwind, AssertUnwindSafe};

use crate::error::StoreError;
use crate::session_id::SessionId;
use crate::store::{MessageStore, StoreFactory, MAX_SEQUENCE_NUMBER};

pub fn contract_session_id() -> SessionId {
    SessionId::new("FIX.4.4", "SENDER", "TARGET")
}

/// Builds a FIX message with a valid body length and checksum.
pub fn fix_message(message_type: &str, sequence_number: u64, body: &str) -> Vec<u8> {
    let mut fields = format!(
        "35={}\x0134={}\x0149=SENDER\x0152=20230908-08:24:56.574\x0156=TARGET\x01",
        message_type, sequence_number
    );
    fields.push_str(body);

    let mut message = format!("8=FIX.4.4\x019={}\x01{}", fields.len(), fields).into_bytes();
    let checksum = message.iter().map(|b| u32::from(*b)).sum::<u32>() % 256;
    message.extend_from_slice(format!("10={:03}\x01", checksum).as_bytes());
    message
}

async fn on_setup<F: StoreFactory>(factory: &F, session_id: &SessionId) -> F::Store {
    let mut store = factory
        .create(session_id)
        .await
        .unwrap_or_else(|err| panic!("failed to create store for {}: {}", session_id, err));
    store
        .reset()
        .await
        .unwrap_or_else(|err| panic!("failed to reset store for {}: {}", session_id, err));
    store
}

async fn on_teardown<F: StoreFactory>(
    factory: &F,
    store: F::Store,
    outcome: Result<(), Box<dyn Any + Send>>,
) {
    let destroyed = factory.destroy(store).await;
    if let Err(panic) = outcome {
        resume_unwind(panic);
    }
    if let Err(err) = destroyed {
        panic!("failed to destroy store: {}", err);
    }
}

async fn read<S: MessageStore>(store: &S, begin: u64, end: u64) -> Vec<Vec<u8>> {
    store
        .get_slice(begin, end)
        .await
        .unwrap_or_else(|err| panic!("get_slice({}, {}) failed: {}", begin, end, err))
}

/// Messages written can be read back byte for byte, in sequence order.
pub async fn set_get<F: StoreFactory>(factory: &F) {
    let session_id = contract_session_id();
    let mut store = on_setup(factory, &session_id).await;
    let outcome = AssertUnwindSafe(check_set_get(&mut store))
        .catch_unwind()
        .await;
    on_teardown(factory, store, outcome).await;
}

async fn check_set_get<S: MessageStore>(store: &mut S) {
    let logon = fix_message("A", 1, "98=0\x01108=30\x01");
    let heartbeat = fix_message("0", 2, "");
    let new_order = fix_message(
        "D",
        3,
        "11=ORDERID\x0121=1\x0155=EUR/USD\x0154=1\x0160=20230908-08:24:56\x0138=230\x0140=1\x01",
    );
    store.add(1, &logon).await.unwrap();
    store.add(2, &heartbeat).await.unwrap();
    store.add(3, &new_order).await.unwrap();

    assert_eq!(
        read(store, 1, 3).await,
        vec![logon.clone(), heartbeat.clone(), new_order.clone()]
    );
    assert_eq!(read(store, 1, 1).await, vec![logon]);
    assert_eq!(read(store, 2, 6).await, vec![heartbeat, new_order]);
    assert!(read(store, 4, 6).await.is_empty());

    // payloads are opaque, whatever bytes go in come back out
    let binary: Vec<u8> = (0..=255).collect();
    store.add(4, &binary).await.unwrap();
    store.add(5, b"").await.unwrap();
    assert_eq!(read(store, 4, 5).await, vec![binary, vec![]]);
}

/// Range reads skip unused sequence numbers and honour their bounds.
pub async fn get_range<F: StoreFactory>(factory: &F) {
    let session_id = contract_session_id();
    let mut store = on_setup(factory, &session_id).await;
    let outcome = AssertUnwindSafe(check_get_range(&mut store))
        .catch_unwind()
        .await;
    on_teardown(factory, store, outcome).await;
}

async fn check_get_range<S: MessageStore>(store: &mut S) {
    // written out of order, with gaps at 1, 3-4, 6 and 8-9
    for sequence_number in [7, 2, 10, 5] {
        let message = fix_message("D", sequence_number, "");
        store.add(sequence_number, &message).await.unwrap();
    }
    let expected = |numbers: &[u64]| -> Vec<Vec<u8>> {
        numbers.iter().map(|n| fix_message("D", *n, "")).collect()
    };

    assert_eq!(read(store, 1, 10).await, expected(&[2, 5, 7, 10]));
    assert_eq!(read(store, 3, 7).await, expected(&[5, 7]));
    assert_eq!(read(store, 5, 5).await, expected(&[5]));
    assert!(read(store, 3, 4).await.is_empty());
    assert!(read(store, 8, 9).await.is_empty());
    assert!(read(store, 11, 20).await.is_empty());
    assert!(read(store, 7, 2).await.is_empty());
    assert_eq!(read(store, 6, u64::MAX).await, expected(&[7, 10]));

    // a sequence number that is already taken gets overwritten
    let replacement = fix_message("4", 5, "123=Y\x0136=6\x01");
    store.add(5, &replacement).await.unwrap();
    assert_eq!(read(store, 5, 5).await, vec![replacement]);
    assert_eq!(read(store, 1, u64::MAX).await.len(), 4);

    assert!(matches!(
        store.add(0, b"invalid").await,
        Err(StoreError::InvalidSequenceNumber(0))
    ));
}

/// Sequence number bookkeeping and reset.
pub async fn other<F: StoreFactory>(factory: &F) {
    let session_id = contract_session_id();
    let mut store = on_setup(factory, &session_id).await;
    let outcome = AssertUnwindSafe(check_other(&mut store)).catch_unwind().await;
    on_teardown(factory, store, outcome).await;
}

async fn check_other<S: MessageStore>(store: &mut S) {
    assert_eq!(store.next_sender_seq_number(), 1);
    assert_eq!(store.next_target_seq_number(), 1);

    for _ in 0..3 {
        store.increment_sender_seq_number().await.unwrap();
    }
    assert_eq!(store.next_sender_seq_number(), 4);
    assert_eq!(store.next_target_seq_number(), 1);

    store.increment_target_seq_number().await.unwrap();
    assert_eq!(store.next_target_seq_number(), 2);

    store.set_next_sender_seq_number(10).await.unwrap();
    store.set_next_target_seq_number(20).await.unwrap();
    assert_eq!(store.next_sender_seq_number(), 10);
    assert_eq!(store.next_target_seq_number(), 20);

    store.increment_sender_seq_number().await.unwrap();
    store.increment_target_seq_number().await.unwrap();
    assert_eq!(store.next_sender_seq_number(), 11);
    assert_eq!(store.next_target_seq_number(), 21);

    assert!(matches!(
        store.set_next_sender_seq_number(0).await,
        Err(StoreError::InvalidSequenceNumber(0))
    ));
    assert!(matches!(
        store.set_next_target_seq_number(0).await,
        Err(StoreError::InvalidSequenceNumber(0))
    ));
    assert_eq!(store.next_sender_seq_number(), 11);
    assert_eq!(store.next_target_seq_number(), 21);

    assert!(matches!(
        store.set_next_sender_seq_number(u64::MAX).await,
        Err(StoreError::InvalidSequenceNumber(u64::MAX))
    ));
    assert!(matches!(
        store.add(u64::MAX, b"too far").await,
        Err(StoreError::InvalidSequenceNumber(u64::MAX))
    ));
    store
        .set_next_sender_seq_number(MAX_SEQUENCE_NUMBER)
        .await
        .unwrap();
    assert!(matches!(
        store.increment_sender_seq_number().await,
        Err(StoreError::InvalidSequenceNumber(_))
    ));
    assert_eq!(store.next_sender_seq_number(), MAX_SEQUENCE_NUMBER);
    store.set_next_sender_seq_number(11).await.unwrap();

    for (sequence_number, body) in [(1, "A"), (2, "B"), (3, "C")] {
        store.add(sequence_number, body.as_bytes()).await.unwrap();
    }
    assert_eq!(
        read(store, 1, 3).await,
        vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]
    );

    let creation_time = store.creation_time();
    let reset_before = store.last_reset_time();
    store.reset().await.unwrap();

    assert_eq!(store.next_sender_seq_number(), 1);
    assert_eq!(store.next_target_seq_number(), 1);
    assert!(read(store, 1, 3).await.is_empty());
    assert!(read(store, 1, u64::MAX).await.is_empty());
    assert_eq!(store.creation_time(), creation_time);
    assert!(store.last_reset_time() >= reset_before);
    assert!(store.last_reset_time() >= store.creation_time());
}

/// Everything written survives destroying the store and creating it again.
pub async fn reload<F: StoreFactory>(factory: &F) {
    let session_id = contract_session_id();
    let mut store = on_setup(factory, &session_id).await;
    let outcome = AssertUnwindSafe(populate_for_reload(&mut store))
        .catch_unwind()
        .await;
    let creation_time = store.creation_time();
    let last_reset_time = store.last_reset_time();
    if outcome.is_err() {
        return on_teardown(factory, store, outcome).await;
    }

    factory
        .destroy(store)
        .await
        .unwrap_or_else(|err| panic!("failed to destroy store: {}", err));
    let mut store = factory
        .create(&session_id)
        .await
        .unwrap_or_else(|err| panic!("failed to recreate store for {}: {}", session_id, err));

    let outcome = AssertUnwindSafe(async {
        assert_eq!(store.creation_time(), creation_time);
        assert_eq!(store.last_reset_time(), last_reset_time);
        check_reloaded(&mut store).await;
    })
    .catch_unwind()
    .await;
    on_teardown(factory, store, outcome).await;
}

async fn populate_for_reload<S: MessageStore>(store: &mut S) {
    store.add(1, &fix_message("A", 1, "98=0\x01")).await.unwrap();
    store.add(2, &fix_message("0", 2, "")).await.unwrap();
    store.add(4, &fix_message("D", 4, "55=EUR/USD\x01")).await.unwrap();
    store.set_next_sender_seq_number(10).await.unwrap();
    store.set_next_target_seq_number(20).await.unwrap();
    store.increment_sender_seq_number().await.unwrap();
    store.increment_target_seq_number().await.unwrap();
}

async fn check_reloaded<S: MessageStore>(store: &mut S) {
    assert_eq!(store.next_sender_seq_number(), 11);
    assert_eq!(store.next_target_seq_number(), 21);
    assert_eq!(
        read(store, 1, 4).await,
        vec![
            fix_message("A", 1, "98=0\x01"),
            fix_message("0", 2, ""),
            fix_message("D", 4, "55=EUR/USD\x01"),
        ]
    );

    // the reloaded store keeps working from where the last one stopped
    store.add(11, &fix_message("0", 11, "")).await.unwrap();
    store.increment_sender_seq_number().await.unwrap();
    assert_eq!(store.next_sender_seq_number(), 12);
    assert_eq!(read(store, 5, u64::MAX).await, vec![fix_message("0", 11, "")]);
}

/// Two stores for the same session see each other's writes.
pub async fn refresh<F: StoreFactory>(factory: &F) {
    let session_id = contract_session_id();
    let mut writer = on_setup(factory, &session_id).await;
    let mut reader = match factory.create(&session_id).await {
        Ok(reader) => reader,
        Err(err) => {
            let _ = factory.destroy(writer).await;
            panic!("failed to create second store for {}: {}", session_id, err);
        }
    };

    let outcome = AssertUnwindSafe(check_refresh(&mut writer, &mut reader))
        .catch_unwind()
        .await;
    let reader_destroyed = factory.destroy(reader).await;
    on_teardown(factory, writer, outcome).await;
    if let Err(err) = reader_destroyed {
        panic!("failed to destroy store: {}", err);
    }
}

async fn check_refresh<S: MessageStore>(writer: &mut S, reader: &mut S) {
    writer.set_next_sender_seq_number(7).await.unwrap();
    writer.set_next_target_seq_number(9).await.unwrap();
    writer.add(6, &fix_message("D", 6, "")).await.unwrap();

    reader.refresh().await.unwrap();
    assert_eq!(reader.next_sender_seq_number(), 7);
    assert_eq!(reader.next_target_seq_number(), 9);
    assert_eq!(read(reader, 1, u64::MAX).await, vec![fix_message("D", 6, "")]);

    writer.reset().await.unwrap();
    reader.refresh().await.unwrap();
    assert_eq!(reader.next_sender_seq_number(), 1);
    assert_eq!(reader.next_target_seq_number(), 1);
    assert!(read(reader, 1, u64::MAX).await.is_empty());
    assert_eq!(reader.last_reset_time(), writer.last_reset_time());
}

/// Runs every case against the factory, one after the other.
pub async fn run_all<F: StoreFactory>(factory: &F) {
    set_get(factory).await;
    get_range(factory).await;
    other(factory).await;
    reload(factory).await;
    refresh(factory).await;
}

/// Generates a `#[tokio::test]` per contract case for one backend.
///
/// `make_factory` is called once per test and returns the factory together with a
/// guard (a temporary directory, say) that has to outlive it.
///
/// ```ignore
/// hotfix_store::message_store_contract_tests! {
///     suite = in_memory,
///     make_factory = || (InMemoryStoreFactory::default(), ()),
/// }
/// ```
#[macro_export]
macro_rules! message_store_contract_tests {
    (suite = $suite:ident, make_factory = $make_factory:expr $(,)?) => {
        mod $suite {
            #[allow(unused_imports)]
            use super::*;

            #[tokio::test]
            async fn set_get() {
                let (factory, _guard) = ($make_factory)();
                $crate::contract::set_get(&factory).await;
            }

            #[tokio::test]
            async fn get_range() {
                let (factory, _guard) = ($make_factory)();
                $crate::contract::get_range(&factory).await;
            }

            #[tokio::test]
            async fn other() {
                let (factory, _guard) = ($make_factory)();
                $crate::contract::other(&factory).await;
            }

            #[tokio::test]
            async fn reload() {
                let (factory, _guard) = ($make_factory)();
                $crate::contract::reload(&factory).await;
            }

            #[tokio::test]
            async fn refresh() {
                let (factory, _guard) = ($make_factory)();
                $crate::contract::refresh(&factory).await;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::contract::fix_message;

    #[test]
    fn test_fix_message_framing() {
        let message = fix_message("A", 1, "98=0\x01108=30\x01");
        let text = String::from_utf8(message.clone()).unwrap();

        assert!(text.starts_with("8=FIX.4.4\x019="));
        assert!(text.ends_with('\x01'));

        let body_start = text.find("35=").unwrap();
        let checksum_start = text.rfind("10=").unwrap();
        let declared: usize = text["8=FIX.4.4\x019=".len()..body_start - 1]
            .parse()
            .unwrap();
        assert_eq!(declared, checksum_start - body_start);

        let checksum: u32 = message[..checksum_start]
            .iter()
            .map(|b| u32::from(*b))
            .sum::<u32>()
            % 256;
        assert_eq!(&text[checksum_start..], format!("10={:03}\x01", checksum));
    }
}
