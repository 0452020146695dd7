use fedledger_keys::CryptoSession;
use tokio::task::JoinSet;

use super::*;
use crate::coordinator::{Action, RoundPhase};
use crate::ledger::LedgerEvent;

#[tokio::test]
async fn single_participant_moves_iteration_forward() {
    let h = Harness::new(1);
    let mut coordinator = h
        .coordinator(CoordinatorConfig {
            max_iterations: 2,
            ..config()
        })
        .await;
    let round_id = coordinator.round().id;
    let mut events = h.chain.subscribe();
    let mut distributions = JoinSet::new();

    let alice = h.connect("alice");
    let session = CryptoSession::generate();
    alice.join(round_id, session.public_key_hex(), 10).await.unwrap();
    assert_eq!(h.owner.billings(round_id).await.unwrap(), 10);

    let announced = next_event(&mut events, round_id).await;
    assert!(matches!(announced, LedgerEvent::KeyAnnounced { .. }));
    coordinator
        .handle_event(announced, &mut distributions)
        .await
        .unwrap();
    distributions.join_next().await.unwrap().unwrap().unwrap();
    assert_eq!(coordinator.keys().cached(), 1);

    let published = next_event(&mut events, round_id).await;
    assert!(matches!(published, LedgerEvent::EncryptedKeyPublished { iteration: 1, .. }));

    train_and_upload(&h, &alice, &session, round_id).await;
    assert_eq!(
        h.owner.trainers(round_id).await.unwrap(),
        vec![Identity::new("alice")]
    );

    let finished = next_event(&mut events, round_id).await;
    assert_eq!(
        finished,
        LedgerEvent::UpdateFinished {
            round_id,
            iteration: 1
        }
    );
    coordinator
        .handle_event(finished, &mut distributions)
        .await
        .unwrap();

    let info = h.owner.round(round_id).await.unwrap();
    assert_eq!(info.iteration, 2);
    assert!(info.trainable);
    assert_eq!(info.global_weights, coordinator.round().global_weights);
    assert_eq!(coordinator.round().iteration, 2);
    assert_eq!(coordinator.round().phase, RoundPhase::AwaitingUpdates);
}

#[tokio::test]
async fn events_for_other_rounds_change_nothing() {
    let h = Harness::new(1);
    let mut coordinator = h.coordinator(config()).await;
    let mut round = coordinator.round().clone();
    let before = round.clone();
    let nonce = h.chain.nonce_of(h.owner.identity()).await;

    let foreign = [
        LedgerEvent::KeyAnnounced {
            round_id: round.id + 1,
            participant: Identity::new("mallory"),
            public_key: "00".repeat(32),
        },
        LedgerEvent::UpdateFinished {
            round_id: round.id + 1,
            iteration: 1,
        },
    ];
    for event in &foreign {
        assert_eq!(round.on_event(event), Action::Ignore);
    }
    assert_eq!(round, before);

    // through the event task: no distribution, no ledger call
    let mut distributions = JoinSet::new();
    for event in foreign {
        coordinator
            .handle_event(event, &mut distributions)
            .await
            .unwrap();
    }
    assert!(distributions.is_empty());
    assert_eq!(coordinator.keys().cached(), 0);
    assert_eq!(coordinator.round(), &before);
    assert_eq!(h.chain.nonce_of(h.owner.identity()).await, nonce);
}

#[tokio::test]
async fn unhandled_kinds_are_ignored() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let mut round = coordinator.round().clone();
    let id = round.id;

    let own = LedgerEvent::TrainableChanged {
        round_id: id,
        trainable: false,
    };
    assert_eq!(round.on_event(&own), Action::Ignore);

    // a completion left over from another iteration
    let stale = LedgerEvent::UpdateFinished {
        round_id: id,
        iteration: 2,
    };
    assert_eq!(round.on_event(&stale), Action::Ignore);
    assert_eq!(round.phase, RoundPhase::AwaitingUpdates);

    // a second completion while aggregating must not start another cycle
    let finished = LedgerEvent::UpdateFinished {
        round_id: id,
        iteration: 1,
    };
    assert_eq!(round.on_event(&finished), Action::Aggregate { iteration: 1 });
    assert_eq!(round.phase, RoundPhase::Aggregating);
    assert_eq!(round.on_event(&finished), Action::Ignore);
}

#[tokio::test]
async fn key_announcement_records_participant() {
    let h = Harness::new(1);
    let coordinator = h.coordinator(config()).await;
    let mut round = coordinator.round().clone();

    let announced = LedgerEvent::KeyAnnounced {
        round_id: round.id,
        participant: Identity::new("alice"),
        public_key: "ab".repeat(32),
    };
    assert_eq!(
        round.on_event(&announced),
        Action::Distribute {
            participant: Identity::new("alice"),
            public_key: "ab".repeat(32),
        }
    );
    let record = &round.participants[&Identity::new("alice")];
    assert_eq!(record.public_key, "ab".repeat(32));
    assert_eq!(record.update, None);
}
