use proptest::prelude::*;
use crate::mailbox::{MailboxError, SignalBoard};
use tether_core::signal::{SignalKind, SignalMessage};
use tether_core::types::UserId;

fn candidate(payload: String) -> SignalMessage {
    SignalMessage::new(SignalKind::IceCandidate, payload, "alice".into(), "bob".into())
}

proptest! {
    // Signals come back in the order they were posted.
    #[test]
    fn test_read_preserves_post_order(
        payloads in prop::collection::vec("[a-z0-9 ]{0,32}", 1..30)
    ) {
        let board = SignalBoard::new();
        for p in &payloads {
            board.post(candidate(p.clone()), 100).unwrap();
        }

        let read = board.read(&UserId::from("bob"), &UserId::from("alice"), None);
        let got: Vec<_> = read.iter().map(|d| d.message.payload.clone()).collect();
        prop_assert_eq!(got, payloads);
        prop_assert!(read.windows(2).all(|w| w[0].id < w[1].id));
    }

    // Reading after a cursor returns exactly the suffix.
    #[test]
    fn test_cursor_returns_suffix(
        count in 1..30usize,
        split in 0..30usize,
    ) {
        let board = SignalBoard::new();
        let ids: Vec<_> = (0..count)
            .map(|i| board.post(candidate(i.to_string()), 100).unwrap())
            .collect();
        let split = split % count;

        let rest = board.read(&UserId::from("bob"), &UserId::from("alice"), Some(&ids[split]));
        prop_assert_eq!(rest.len(), count - split - 1);
        for (delivery, id) in rest.iter().zip(&ids[split + 1..]) {
            prop_assert_eq!(&delivery.id, id);
        }
    }

    // Mailboxes never hold more than the configured length.
    #[test]
    fn test_mailbox_limit_enforced(
        limit in 1..20usize,
        extras in 1..10usize,
    ) {
        let board = SignalBoard::new();
        for i in 0..limit {
            prop_assert!(board.post(candidate(i.to_string()), limit).is_ok());
        }
        for i in 0..extras {
            prop_assert_eq!(
                board.post(candidate(i.to_string()), limit),
                Err(MailboxError::QueueFull)
            );
        }
        prop_assert_eq!(board.pending_count(), limit);
    }

    // Deleting a signal leaves every other one readable.
    #[test]
    fn test_delete_only_removes_target(
        count in 1..20usize,
        victim in 0..20usize,
    ) {
        let board = SignalBoard::new();
        let (bob, alice) = (UserId::from("bob"), UserId::from("alice"));
        let ids: Vec<_> = (0..count)
            .map(|i| board.post(candidate(i.to_string()), 100).unwrap())
            .collect();
        let victim = victim % count;

        prop_assert!(board.delete(&bob, &alice, &ids[victim]));
        let left: Vec<_> = board.read(&bob, &alice, None).into_iter().map(|d| d.id).collect();
        let expected: Vec<_> = ids.iter().enumerate()
            .filter(|(i, _)| *i != victim)
            .map(|(_, id)| id.clone())
            .collect();
        prop_assert_eq!(left, expected);
    }
}
