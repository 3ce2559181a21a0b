use hotfix_store::contract::contract_session_id;
use hotfix_store::store::file::FileStoreFactory;
use hotfix_store::{MessageStore, SessionId, StoreError, StoreFactory};
use tempfile::TempDir;

fn file_factory() -> (FileStoreFactory, TempDir) {
    let directory = tempfile::tempdir().unwrap();
    (FileStoreFactory::new(directory.path().join("store")), directory)
}

hotfix_store::message_store_contract_tests! {
    suite = file,
    make_factory = file_factory,
}

#[tokio::test]
async fn test_files_are_named_after_the_session() {
    let (factory, directory) = file_factory();
    let mut store = factory.create(&contract_session_id()).await.unwrap();
    store.add(1, b"8=FIX.4.4\x01").await.unwrap();
    store.set_next_sender_seq_number(2).await.unwrap();
    factory.destroy(store).await.unwrap();

    let store_directory = directory.path().join("store");
    for extension in ["body", "header", "seqnums", "session"] {
        let path = store_directory.join(format!("FIX.4.4-SENDER-TARGET.{}", extension));
        assert!(path.exists(), "{} is missing", path.display());
    }

    let seqnums =
        std::fs::read_to_string(store_directory.join("FIX.4.4-SENDER-TARGET.seqnums")).unwrap();
    assert_eq!(seqnums, "0000000002 : 0000000001");
    let header =
        std::fs::read_to_string(store_directory.join("FIX.4.4-SENDER-TARGET.header")).unwrap();
    assert_eq!(header, "1,0,10\n");
}

#[tokio::test]
async fn test_corrupt_sequence_numbers_are_reported() {
    let (factory, directory) = file_factory();
    let store = factory.create(&contract_session_id()).await.unwrap();
    factory.destroy(store).await.unwrap();

    let seqnums = directory
        .path()
        .join("store")
        .join("FIX.4.4-SENDER-TARGET.seqnums");
    std::fs::write(seqnums, "not a number").unwrap();

    let result = factory.create(&contract_session_id()).await;
    assert!(matches!(result, Err(StoreError::Corrupt(_))));
}

#[tokio::test]
async fn test_sessions_do_not_share_files() {
    let (factory, _directory) = file_factory();
    let session_id = contract_session_id();
    let qualified = contract_session_id().with_qualifier("drop-copy");

    let mut first = factory.create(&session_id).await.unwrap();
    let mut second = factory.create(&qualified).await.unwrap();
    first.add(1, b"first").await.unwrap();
    second.add(1, b"second").await.unwrap();
    second.increment_target_seq_number().await.unwrap();

    assert_eq!(first.get_slice(1, 1).await.unwrap(), vec![b"first".to_vec()]);
    assert_eq!(second.get_slice(1, 1).await.unwrap(), vec![b"second".to_vec()]);
    assert_eq!(first.next_target_seq_number(), 1);
    assert_eq!(second.next_target_seq_number(), 2);
}

#[tokio::test]
async fn test_similar_session_ids_do_not_share_files() {
    let (factory, directory) = file_factory();
    let dashed = SessionId::new("FIX.4.4", "validus-fix", "FXALL");
    let underscored = SessionId::new("FIX.4.4", "validus_fix", "FXALL");

    let mut first = factory.create(&dashed).await.unwrap();
    let mut second = factory.create(&underscored).await.unwrap();
    first.add(1, b"from-dashed").await.unwrap();
    first.set_next_sender_seq_number(7).await.unwrap();

    assert!(second.get_slice(1, u64::MAX).await.unwrap().is_empty());
    second.refresh().await.unwrap();
    assert_eq!(second.next_sender_seq_number(), 1);

    let store_directory = directory.path().join("store");
    assert!(store_directory.join("FIX.4.4-validus%2Dfix-FXALL.body").exists());
    assert!(store_directory.join("FIX.4.4-validus_fix-FXALL.body").exists());
}

#[tokio::test]
async fn test_reader_sees_reset_when_header_length_is_unchanged() {
    let (factory, _directory) = file_factory();
    let session_id = contract_session_id();
    let mut writer = factory.create(&session_id).await.unwrap();
    let reader = factory.create(&session_id).await.unwrap();

    writer.add(1, b"X").await.unwrap();
    assert_eq!(reader.get_slice(1, 1).await.unwrap(), vec![b"X".to_vec()]);

    // "2,0,1" replaces "1,0,1", so the header keeps its length
    writer.reset().await.unwrap();
    writer.add(2, b"Y").await.unwrap();

    assert!(reader.get_slice(1, 1).await.unwrap().is_empty());
    assert_eq!(
        reader.get_slice(1, u64::MAX).await.unwrap(),
        vec![b"Y".to_vec()]
    );
}

#[tokio::test]
async fn test_failed_reset_keeps_messages_and_counters() {
    let (factory, directory) = file_factory();
    let session_id = contract_session_id();
    let mut store = factory.create(&session_id).await.unwrap();
    store.add(1, b"kept").await.unwrap();
    store.set_next_sender_seq_number(5).await.unwrap();

    // a directory where the replacement session file would be written
    let blocker = directory
        .path()
        .join("store")
        .join(format!("{}.session.tmp", session_id.storage_key()));
    std::fs::create_dir(&blocker).unwrap();

    assert!(matches!(store.reset().await, Err(StoreError::Io(_))));
    assert_eq!(store.get_slice(1, 1).await.unwrap(), vec![b"kept".to_vec()]);
    assert_eq!(store.next_sender_seq_number(), 5);

    std::fs::remove_dir(&blocker).unwrap();
    let reopened = factory.create(&session_id).await.unwrap();
    assert_eq!(reopened.get_slice(1, 1).await.unwrap(), vec![b"kept".to_vec()]);
    assert_eq!(reopened.next_sender_seq_number(), 5);
}

#[tokio::test]
async fn test_store_directory_that_is_a_file_is_reported() {
    let directory = tempfile::tempdir().unwrap();
    let not_a_directory = directory.path().join("store");
    std::fs::write(&not_a_directory, "occupied").unwrap();

    let factory = FileStoreFactory::new(&not_a_directory);
    let result = factory.create(&contract_session_id()).await;
    assert!(matches!(result, Err(StoreError::Io(_))));
}
