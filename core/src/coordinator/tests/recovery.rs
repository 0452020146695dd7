use fedledger_keys::CryptoSession;
use tokio::task::JoinSet;

use super::*;
use crate::coordinator::RoundPhase;

/// Opens unrelated rounds until older events fall out of a small buffer.
async fn flood(h: &Harness, round_id: RoundId) {
    let other = h.connect("other");
    let blob = h.owner.round(round_id).await.unwrap().architecture;
    for _ in 0..3 {
        other
            .create(blob.clone(), blob.clone(), 1, "00".repeat(32))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn lagged_coordinator_aggregates_from_ledger_state() {
    let h = Harness::with_event_buffer(1, 2);
    let coordinator = h
        .coordinator(CoordinatorConfig {
            max_iterations: 1,
            ..config()
        })
        .await;
    let round_id = coordinator.round().id;
    let round_key = coordinator.keys().round_key().await;

    let alice = h.connect("alice");
    let session = CryptoSession::generate();
    alice
        .join(round_id, session.public_key_hex(), 10)
        .await
        .unwrap();
    upload_with_key(&h, &alice, &session, round_id, &round_key).await;
    assert!(!h.owner.round(round_id).await.unwrap().trainable);

    // KeyAnnounced and UpdateFinished are gone before the loop starts
    flood(&h, round_id).await;

    let summary = tokio::time::timeout(Duration::from_secs(5), coordinator.spawn().join())
        .await
        .expect("round did not close")
        .unwrap();

    assert_eq!(summary.cycles.len(), 1);
    assert_eq!(summary.cycles[0].contributors, vec![Identity::new("alice")]);
    assert_eq!(summary.payment, Some(1));

    let info = h.owner.round(round_id).await.unwrap();
    assert!(!info.active);
    assert_eq!(info.iteration, 2);
    assert_eq!(h.owner.balance_of(&Identity::new("alice")).await.unwrap(), 1);
}

#[tokio::test]
async fn lagged_coordinator_distributes_missed_announcements() {
    let h = Harness::with_event_buffer(2, 2);
    let coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;

    for name in ["alice", "bob"] {
        h.connect(name)
            .join(round_id, CryptoSession::generate().public_key_hex(), 10)
            .await
            .unwrap();
    }
    flood(&h, round_id).await;

    let mut handle = coordinator.spawn();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut published = 0;
            for name in ["alice", "bob"] {
                let key = h
                    .owner
                    .encrypted_key(round_id, &Identity::new(name))
                    .await
                    .unwrap();
                if key.is_some_and(|k| k.iteration == 1) {
                    published += 1;
                }
            }
            if published == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("keys were not distributed");

    let status = handle.status().await.unwrap();
    assert_eq!(status.participants, 2);
    assert_eq!(status.phase, RoundPhase::AwaitingUpdates);

    // nobody uploaded, so the lag must not have started a cycle
    handle.wait_for(RoundPhase::AwaitingUpdates).await.unwrap();
    assert_eq!(h.owner.round(round_id).await.unwrap().iteration, 1);
}

#[tokio::test]
async fn reconcile_without_lag_changes_nothing() {
    let h = Harness::new(1);
    let mut coordinator = h.coordinator(config()).await;
    let round_id = coordinator.round().id;
    let before = coordinator.round().clone();
    let nonce = h.chain.nonce_of(h.owner.identity()).await;

    let mut distributions = JoinSet::new();
    coordinator.reconcile(&mut distributions).await.unwrap();

    assert_eq!(coordinator.round(), &before);
    assert!(distributions.is_empty());
    assert_eq!(h.chain.nonce_of(h.owner.identity()).await, nonce);
    assert_eq!(h.owner.round(round_id).await.unwrap().iteration, 1);
}
