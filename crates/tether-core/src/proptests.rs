use proptest::prelude::*;

use crate::config::DeliveryPolicy;
use crate::envelope::EncryptedEnvelope;
use crate::keys::LocalIdentity;
use crate::session::Role;
use crate::signal::SignalId;
use crate::store::{InMemoryMessageStore, MessageStore};
use crate::types::UserId;

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    // Exactly one side of any pair initiates.
    #[test]
    fn test_role_for_pair_is_complementary(
        a in "[a-z]{1,12}",
        b in "[a-z]{1,12}",
    ) {
        prop_assume!(a != b);
        let (a, b) = (UserId::from(a), UserId::from(b));
        prop_assert_ne!(Role::for_pair(&a, &b), Role::for_pair(&b, &a));
    }

    // Relay ids sort in the order they were issued.
    #[test]
    fn test_signal_ids_sort_by_sequence(x in any::<u64>(), y in any::<u64>()) {
        let (a, b) = (SignalId::from_sequence(x), SignalId::from_sequence(y));
        prop_assert_eq!(a.cmp(&b), x.cmp(&y));
    }

    #[test]
    fn test_policy_parses_its_own_display(
        policy in prop_oneof![
            Just(DeliveryPolicy::PreferLive),
            Just(DeliveryPolicy::StoreOnly),
            Just(DeliveryPolicy::LiveAndStore),
        ]
    ) {
        prop_assert_eq!(policy.to_string().parse::<DeliveryPolicy>().unwrap(), policy);
    }

    // Only the intended recipient can open a sealed envelope.
    #[test]
    fn test_sealed_envelope_opens_for_recipient_only(text in "\\PC{0,200}") {
        let bob = LocalIdentity::generate("bob");
        let eve = LocalIdentity::generate("eve");

        let envelope = EncryptedEnvelope::seal(&text, bob.public_key()).unwrap();
        prop_assert!(envelope.encrypted);
        prop_assert_eq!(envelope.open(bob.private_key()).unwrap(), text);
        prop_assert!(envelope.open(eve.private_key()).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // History is the newest `limit` messages of the conversation, oldest first.
    #[test]
    fn test_query_returns_newest_in_order(
        count in 0..40usize,
        limit in 1..50usize,
    ) {
        let (alice, bob, carol) = (UserId::from("alice"), UserId::from("bob"), UserId::from("carol"));
        let (got, ids) = block_on(async {
            let store = InMemoryMessageStore::new();
            let mut ids = Vec::new();
            for i in 0..count {
                let (from, to) = if i % 2 == 0 { (&alice, &bob) } else { (&bob, &alice) };
                let envelope = EncryptedEnvelope::legacy_plaintext(i.to_string());
                ids.push(store.append(from, to, envelope).await.unwrap());
                // Unrelated traffic never shows up.
                store
                    .append(&carol, &bob, EncryptedEnvelope::legacy_plaintext("x"))
                    .await
                    .unwrap();
            }
            let got = store.query(&alice, &bob, limit).await.unwrap();
            (got, ids)
        });

        let expected = &ids[ids.len().saturating_sub(limit)..];
        let got: Vec<_> = got.into_iter().map(|m| m.id).collect();
        prop_assert_eq!(&got[..], expected);
    }
}
