//! Coordinator scenario tests against the in-memory chain and store.

mod distribution;
mod recovery;
mod scenario;

use std::sync::Arc;
use std::time::Duration;

use fedledger_blob::{ContentAddress, MemoryStore, load_weights, store_weights};
use fedledger_keys::{CryptoSession, SymmetricKey, WrappedKey, unwrap_key};
use fedledger_weights::WeightCollection;

use super::{Coordinator, CoordinatorConfig};
use crate::ledger::{
    Delivery, Identity, Ledger, LedgerEvent, MemoryChain, MemoryLedger, RoundId, Subscription,
};
use crate::participant::Participant;
use crate::trainer::{LinearTrainer, Trainer};

// ============================================================================
// Test Helpers
// ============================================================================

pub(super) const DIMS: usize = 3;

pub(super) type TestCoordinator = Coordinator<MemoryLedger, MemoryStore, LinearTrainer>;

pub(super) struct Harness {
    pub chain: Arc<MemoryChain>,
    pub store: Arc<MemoryStore>,
    pub owner: Arc<MemoryLedger>,
}

impl Harness {
    pub fn new(quorum: usize) -> Self {
        Self::with_event_buffer(quorum, 256)
    }

    pub fn with_event_buffer(quorum: usize, event_buffer: usize) -> Self {
        let chain = Arc::new(MemoryChain::new(event_buffer).with_quorum(quorum));
        let owner = Arc::new(chain.connect(Identity::new("owner")));
        Self {
            chain,
            // small chunks so every load reassembles several pieces
            store: Arc::new(MemoryStore::new(16)),
            owner,
        }
    }

    pub fn connect(&self, name: &str) -> Arc<MemoryLedger> {
        Arc::new(self.chain.connect(Identity::new(name)))
    }

    pub async fn coordinator(&self, config: CoordinatorConfig) -> TestCoordinator {
        let trainer = LinearTrainer::new(DIMS, 0);
        let initial = WeightCollection::zeros(&trainer.model_shape());
        Coordinator::create(
            config,
            Arc::clone(&self.owner),
            Arc::clone(&self.store),
            Arc::new(trainer),
            CryptoSession::generate(),
            initial,
        )
        .await
        .unwrap()
    }

    pub fn participant(
        &self,
        name: &str,
        seed: u64,
        round_id: RoundId,
    ) -> Participant<MemoryLedger, MemoryStore, LinearTrainer> {
        Participant::new(
            self.connect(name),
            Arc::clone(&self.store),
            Arc::new(LinearTrainer::new(DIMS, seed)),
            CryptoSession::generate(),
            round_id,
        )
    }
}

pub(super) fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        ledger_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

/// Next event for `round_id`, failing the test if none arrives in time.
pub(super) async fn next_event(events: &mut Subscription, round_id: RoundId) -> LedgerEvent {
    loop {
        let delivery = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no event within 5s");
        match delivery {
            Delivery::Event(e) if e.round_id() == round_id => return e,
            Delivery::Event(_) | Delivery::Lagged(_) => {}
            other => panic!("stream ended: {other:?}"),
        }
    }
}

/// Does one participant iteration by hand: unwrap the round key, decrypt the
/// global model, train, upload the update.
pub(super) async fn train_and_upload(
    harness: &Harness,
    ledger: &MemoryLedger,
    session: &CryptoSession,
    round_id: RoundId,
) -> ContentAddress {
    let owner_key = ledger.owner_public_key(round_id).await.unwrap();
    let secret = session.derive(&owner_key).unwrap();

    let wrapped = ledger
        .encrypted_key(round_id, ledger.identity())
        .await
        .unwrap()
        .expect("key published");
    let round_key =
        unwrap_key(&WrappedKey::from_hex(&wrapped.wrapped).unwrap(), &secret).unwrap();

    upload_with_key(harness, ledger, session, round_id, &round_key).await
}

/// Trains on the global model decrypted with `round_key` and uploads.
pub(super) async fn upload_with_key(
    harness: &Harness,
    ledger: &MemoryLedger,
    session: &CryptoSession,
    round_id: RoundId,
    round_key: &SymmetricKey,
) -> ContentAddress {
    let owner_key = ledger.owner_public_key(round_id).await.unwrap();
    let secret = session.derive(&owner_key).unwrap();

    let trainer = LinearTrainer::new(DIMS, 7);
    let info = ledger.round(round_id).await.unwrap();
    let global = load_weights(
        harness.store.as_ref(),
        &info.global_weights,
        round_key,
        &trainer.model_shape(),
    )
    .await
    .unwrap();

    let update = trainer.train(&global).unwrap();
    let address = store_weights(
        harness.store.as_ref(),
        &update,
        &secret.update_key().unwrap(),
    )
    .await
    .unwrap();
    ledger.local_upload(round_id, address.clone()).await.unwrap();
    address
}
