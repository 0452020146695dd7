use fedledger_keys::CryptoSession;
use futures::future::join_all;

use super::*;
use crate::coordinator::CoordinatorError;
use crate::ledger::LedgerError;

#[tokio::test]
async fn concurrent_distribution_through_the_lane() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    let mut members = Vec::new();
    for i in 0..5 {
        let ledger = h.connect(&format!("p{i}"));
        let session = CryptoSession::generate();
        ledger
            .join(round_id, session.public_key_hex(), 10)
            .await
            .unwrap();
        members.push((ledger, session));
    }

    let keys = coordinator.keys();
    let results = join_all(members.iter().map(|(ledger, session)| async move {
        keys.distribute_to(ledger.identity().clone(), &session.public_key_hex())
            .await
    }))
    .await;
    assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
    assert_eq!(keys.cached(), 5);

    let round_key = keys.round_key().await;
    let owner_key = h.owner.owner_public_key(round_id).await.unwrap();
    for (ledger, session) in &members {
        let wrapped = h
            .owner
            .encrypted_key(round_id, ledger.identity())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wrapped.iteration, 1);
        let secret = session.derive(&owner_key).unwrap();
        let unwrapped =
            unwrap_key(&WrappedKey::from_hex(&wrapped.wrapped).unwrap(), &secret).unwrap();
        assert_eq!(unwrapped, round_key);
    }
}

#[tokio::test]
async fn unsynchronized_submissions_are_rejected() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    for name in ["alice", "bob"] {
        h.connect(name)
            .join(round_id, CryptoSession::generate().public_key_hex(), 10)
            .await
            .unwrap();
    }

    // same account, no lane: both read the same sequence number
    let (a, b) = tokio::join!(
        h.owner
            .update_encrypted_key(round_id, Identity::new("alice"), "aa".into()),
        h.owner
            .update_encrypted_key(round_id, Identity::new("bob"), "bb".into()),
    );
    assert!(a.is_ok());
    assert!(matches!(b, Err(LedgerError::StaleNonce { .. })));
}

#[tokio::test]
async fn secret_is_cached_across_iterations() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    let alice = h.connect("alice");
    let session = CryptoSession::generate();
    alice
        .join(round_id, session.public_key_hex(), 10)
        .await
        .unwrap();

    let keys = coordinator.keys();
    let identity = Identity::new("alice");
    keys.distribute_to(identity.clone(), &session.public_key_hex())
        .await
        .unwrap();
    let first = keys.pairwise_secret(&identity).unwrap();

    // rotate, then redistribute: the cached secret is reused
    keys.lane().await.rotate(fedledger_keys::SymmetricKey::generate());
    keys.distribute_to(identity.clone(), &session.public_key_hex())
        .await
        .unwrap();

    assert_eq!(keys.cached(), 1);
    assert_eq!(keys.pairwise_secret(&identity).unwrap(), first);
}

#[tokio::test]
async fn malformed_public_key_fails_distribution() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;

    let err = coordinator
        .keys()
        .distribute_to(Identity::new("mallory"), "not-hex")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidKeyMaterial(_)));
    assert_eq!(coordinator.keys().cached(), 0);
}

#[tokio::test]
async fn reannounced_key_keeps_first_secret() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    let alice = h.connect("alice");
    let first = CryptoSession::generate();
    let restarted = CryptoSession::generate();
    alice.join(round_id, first.public_key_hex(), 10).await.unwrap();

    let keys = coordinator.keys();
    let identity = Identity::new("alice");
    keys.distribute_to(identity.clone(), &first.public_key_hex())
        .await
        .unwrap();
    keys.distribute_to(identity.clone(), &restarted.public_key_hex())
        .await
        .unwrap();

    // still wrapped for the first session
    let owner_key = h.owner.owner_public_key(round_id).await.unwrap();
    let published = h
        .owner
        .encrypted_key(round_id, &identity)
        .await
        .unwrap()
        .unwrap();
    let wrapped = WrappedKey::from_hex(&published.wrapped).unwrap();
    let secret = first.derive(&owner_key).unwrap();
    assert_eq!(unwrap_key(&wrapped, &secret).unwrap(), keys.round_key().await);
    assert_eq!(keys.cached(), 1);
}

#[tokio::test]
async fn recover_caches_without_publishing() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    let session = CryptoSession::generate();
    h.connect("alice")
        .join(round_id, session.public_key_hex(), 10)
        .await
        .unwrap();
    let nonce = h.chain.nonce_of(h.owner.identity()).await;

    let identity = Identity::new("alice");
    coordinator
        .keys()
        .recover(&identity, &session.public_key_hex())
        .await
        .unwrap();

    assert!(coordinator.keys().pairwise_secret(&identity).is_some());
    assert_eq!(h.chain.nonce_of(h.owner.identity()).await, nonce);
    assert_eq!(h.owner.encrypted_key(round_id, &identity).await.unwrap(), None);
}
