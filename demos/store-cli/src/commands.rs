use hotfix_store::{MessageStore, SessionId, StoreFactory};
use tracing::{error, info};

use crate::Command;

pub async fn run(
    store: &mut impl MessageStore,
    session_id: &SessionId,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Show => {
            println!("session:          {}", session_id);
            println!("next sender:      {}", store.next_sender_seq_number());
            println!("next target:      {}", store.next_target_seq_number());
            println!("created:          {}", store.creation_time());
            println!("last reset:       {}", store.last_reset_time());
        }
        Command::Messages { begin, end } => {
            let messages = store.get_slice(begin, end).await?;
            for message in &messages {
                println!("{}", pretty(message));
            }
            info!(begin, end, count = messages.len(), "listed messages");
        }
        Command::Add {
            sequence_number,
            message,
        } => {
            store.add(sequence_number, &from_pretty(&message)).await?;
            info!(sequence_number, "stored message");
        }
        Command::Reset => {
            store.reset().await?;
            info!(%session_id, "store reset");
        }
        Command::SetNextSender { sequence_number } => {
            store.set_next_sender_seq_number(sequence_number).await?;
        }
        Command::SetNextTarget { sequence_number } => {
            store.set_next_target_seq_number(sequence_number).await?;
        }
    }

    Ok(())
}

/// Runs `command`, then hands the store back to `factory`.
///
/// When both fail, the command's error is returned and the close failure is logged.
pub async fn run_and_close<F: StoreFactory>(
    factory: &F,
    mut store: F::Store,
    session_id: &SessionId,
    command: Command,
) -> anyhow::Result<()> {
    let result = run(&mut store, session_id, command).await;
    let closed = factory.destroy(store).await;

    if let (Err(_), Err(err)) = (&result, &closed) {
        error!(%err, "failed to close the store");
        return result;
    }
    result?;
    Ok(closed?)
}

fn pretty(message: &[u8]) -> String {
    let pretty_bytes: Vec<u8> = message
        .iter()
        .map(|b| if *b == b'\x01' { b'|' } else { *b })
        .collect();
    String::from_utf8_lossy(&pretty_bytes).into_owned()
}

fn from_pretty(message: &str) -> Vec<u8> {
    message
        .bytes()
        .map(|b| if b == b'|' { b'\x01' } else { b })
        .collect()
}

#[cfg(test)]
mod tests {
    use hotfix_store::store::in_memory::{InMemoryMessageStore, InMemoryStoreFactory};
    use hotfix_store::{MessageStore, SessionId, StoreError, StoreFactory};

    use crate::commands::{from_pretty, pretty, run, run_and_close};
    use crate::Command;

    /// Hands out in-memory stores but fails to close them.
    #[derive(Default)]
    struct UnclosableFactory(InMemoryStoreFactory);

    #[async_trait::async_trait]
    impl StoreFactory for UnclosableFactory {
        type Store = InMemoryMessageStore;

        async fn create(&self, session_id: &SessionId) -> Result<Self::Store, StoreError> {
            self.0.create(session_id).await
        }

        async fn destroy(&self, _store: Self::Store) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("store directory went away".to_string()))
        }
    }

    #[test]
    fn test_pretty_round_trip() {
        let raw = b"8=FIX.4.4\x019=5\x0135=0\x0110=163\x01";
        assert_eq!(pretty(raw), "8=FIX.4.4|9=5|35=0|10=163|");
        assert_eq!(from_pretty(&pretty(raw)), raw.to_vec());
    }

    #[tokio::test]
    async fn test_commands_update_the_store() {
        let mut store = InMemoryMessageStore::default();
        let session_id = SessionId::new("FIX.4.4", "validus-fix", "FXALL");

        let add = Command::Add {
            sequence_number: 1,
            message: "8=FIX.4.4|35=A|".to_string(),
        };
        run(&mut store, &session_id, add).await.unwrap();
        let set_next = Command::SetNextSender { sequence_number: 2 };
        run(&mut store, &session_id, set_next).await.unwrap();

        assert_eq!(
            store.get_slice(1, 1).await.unwrap(),
            vec![b"8=FIX.4.4\x0135=A\x01".to_vec()]
        );
        assert_eq!(store.next_sender_seq_number(), 2);

        run(&mut store, &session_id, Command::Reset).await.unwrap();
        assert!(store.get_slice(1, u64::MAX).await.unwrap().is_empty());
        assert_eq!(store.next_sender_seq_number(), 1);
    }

    #[tokio::test]
    async fn test_invalid_sequence_number_is_an_error() {
        let mut store = InMemoryMessageStore::default();
        let session_id = SessionId::new("FIX.4.4", "validus-fix", "FXALL");

        let command = Command::SetNextTarget { sequence_number: 0 };
        assert!(run(&mut store, &session_id, command).await.is_err());
    }

    #[tokio::test]
    async fn test_command_error_is_not_hidden_by_close_error() {
        let factory = UnclosableFactory::default();
        let session_id = SessionId::new("FIX.4.4", "validus-fix", "FXALL");
        let store = factory.create(&session_id).await.unwrap();

        let command = Command::SetNextSender { sequence_number: 0 };
        let err = run_and_close(&factory, store, &session_id, command)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::InvalidSequenceNumber(0))
        ));
    }

    #[tokio::test]
    async fn test_close_error_is_reported_after_successful_command() {
        let factory = UnclosableFactory::default();
        let session_id = SessionId::new("FIX.4.4", "validus-fix", "FXALL");
        let store = factory.create(&session_id).await.unwrap();

        let err = run_and_close(&factory, store, &session_id, Command::Reset)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Unavailable(_))
        ));
    }
}
