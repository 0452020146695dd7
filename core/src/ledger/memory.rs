//! In-process ledger.
//!
//! `MemoryChain` holds the contract state for every round; `MemoryLedger` is
//! one account's handle onto it. Transactions read the account's next
//! sequence number, suspend, then submit; a submission carrying a stale
//! number is rejected. Two unsynchronized submissions from one account
//! therefore race exactly as they would against a real chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fedledger_blob::ContentAddress;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use super::{
    Identity, Ledger, LedgerError, LedgerEvent, LedgerResult, PublishedKey, RoundId, RoundInfo,
    Subscription,
};

struct RoundRecord {
    info: RoundInfo,
    owner_public_key: String,
    billings: u64,
    paid: HashSet<Identity>,
    public_keys: HashMap<Identity, String>,
    /// Everyone who ever joined, in join order
    participants: Vec<Identity>,
    /// Joiners of the current iteration, in join order
    trainers: Vec<Identity>,
    uploads: HashMap<Identity, ContentAddress>,
    incentives: HashMap<Identity, u64>,
    encrypted_keys: HashMap<Identity, PublishedKey>,
}

impl RoundRecord {
    fn require_owner(&self, caller: &Identity) -> LedgerResult<()> {
        if &self.info.owner == caller {
            Ok(())
        } else {
            Err(LedgerError::Rejected(format!(
                "{caller} is not the owner of round {}",
                self.info.id
            )))
        }
    }

    fn require_active(&self) -> LedgerResult<()> {
        if self.info.active {
            Ok(())
        } else {
            Err(LedgerError::Rejected(format!(
                "round {} is closed",
                self.info.id
            )))
        }
    }
}

#[derive(Default)]
struct ChainState {
    rounds: Vec<RoundRecord>,
    nonces: HashMap<Identity, u64>,
    balances: HashMap<Identity, u64>,
    pending: Vec<LedgerEvent>,
}

impl ChainState {
    fn round(&self, id: RoundId) -> LedgerResult<&RoundRecord> {
        self.rounds
            .get(id as usize)
            .ok_or(LedgerError::UnknownRound(id))
    }

    fn round_mut(&mut self, id: RoundId) -> LedgerResult<&mut RoundRecord> {
        self.rounds
            .get_mut(id as usize)
            .ok_or(LedgerError::UnknownRound(id))
    }

    fn create(
        &mut self,
        caller: &Identity,
        architecture: ContentAddress,
        weights: ContentAddress,
        fee: u64,
        owner_public_key: String,
    ) -> LedgerResult<RoundId> {
        let id = self.rounds.len() as RoundId;
        self.rounds.push(RoundRecord {
            info: RoundInfo {
                id,
                owner: caller.clone(),
                architecture,
                global_weights: weights.clone(),
                iteration: 1,
                fee,
                active: true,
                trainable: true,
            },
            owner_public_key,
            billings: 0,
            paid: HashSet::new(),
            public_keys: HashMap::new(),
            participants: Vec::new(),
            trainers: Vec::new(),
            uploads: HashMap::new(),
            incentives: HashMap::new(),
            encrypted_keys: HashMap::new(),
        });
        self.pending.push(LedgerEvent::GlobalModelUpdated {
            round_id: id,
            iteration: 1,
            weights,
        });
        Ok(id)
    }

    fn join(
        &mut self,
        caller: &Identity,
        id: RoundId,
        public_key: String,
        fee_payment: u64,
    ) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_active()?;
        if !round.info.trainable {
            return Err(LedgerError::Rejected(format!("round {id} is not trainable")));
        }
        if !round.paid.contains(caller) && fee_payment < round.info.fee {
            return Err(LedgerError::Rejected(format!(
                "one-time fee is {}, paid {fee_payment}",
                round.info.fee
            )));
        }

        round.paid.insert(caller.clone());
        round.billings += fee_payment;
        round.public_keys.insert(caller.clone(), public_key.clone());
        if !round.participants.contains(caller) {
            round.participants.push(caller.clone());
        }
        if !round.trainers.contains(caller) {
            round.trainers.push(caller.clone());
        }

        self.pending.push(LedgerEvent::KeyAnnounced {
            round_id: id,
            participant: caller.clone(),
            public_key,
        });
        Ok(())
    }

    fn local_upload(
        &mut self,
        caller: &Identity,
        id: RoundId,
        update: ContentAddress,
        quorum: usize,
    ) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_active()?;
        if !round.info.trainable {
            return Err(LedgerError::Rejected(format!("round {id} is not trainable")));
        }
        if !round.trainers.contains(caller) {
            return Err(LedgerError::Rejected(format!(
                "{caller} is not a trainer of round {id}"
            )));
        }

        round.uploads.insert(caller.clone(), update);

        let complete =
            round.uploads.len() == round.trainers.len() && round.trainers.len() >= quorum;
        if complete {
            round.info.trainable = false;
            let iteration = round.info.iteration;
            self.pending.push(LedgerEvent::UpdateFinished {
                round_id: id,
                iteration,
            });
        }
        Ok(())
    }

    fn update_global_model(
        &mut self,
        caller: &Identity,
        id: RoundId,
        weights: ContentAddress,
        incentives: Vec<u64>,
    ) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_owner(caller)?;
        round.require_active()?;
        if incentives.len() != round.trainers.len() {
            return Err(LedgerError::Rejected(format!(
                "{} incentives for {} trainers",
                incentives.len(),
                round.trainers.len()
            )));
        }

        for (trainer, incentive) in round.trainers.iter().zip(incentives) {
            *round.incentives.entry(trainer.clone()).or_default() += incentive;
        }
        round.info.global_weights = weights.clone();
        round.info.iteration += 1;
        round.trainers.clear();
        round.uploads.clear();

        let iteration = round.info.iteration;
        self.pending.push(LedgerEvent::GlobalModelUpdated {
            round_id: id,
            iteration,
            weights,
        });
        Ok(())
    }

    fn whether_continue(&mut self, caller: &Identity, id: RoundId, proceed: bool) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_owner(caller)?;
        round.require_active()?;
        round.info.trainable = proceed;
        self.pending.push(LedgerEvent::TrainableChanged {
            round_id: id,
            trainable: proceed,
        });
        Ok(())
    }

    fn settle_billings(&mut self, caller: &Identity, id: RoundId, payment: u64) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_owner(caller)?;
        round.require_active()?;
        if payment > round.billings {
            return Err(LedgerError::Rejected(format!(
                "payment {payment} exceeds billings {}",
                round.billings
            )));
        }

        let total: u64 = round
            .participants
            .iter()
            .map(|p| round.incentives.get(p).copied().unwrap_or(0))
            .sum();
        let n = round.participants.len() as u64;

        let mut credits = Vec::with_capacity(round.participants.len());
        for p in &round.participants {
            let share = if total > 0 {
                let incentive = round.incentives.get(p).copied().unwrap_or(0);
                ((payment as u128 * incentive as u128) / total as u128) as u64
            } else {
                payment / n
            };
            credits.push((p.clone(), share));
        }

        let distributed: u64 = credits.iter().map(|(_, s)| s).sum();
        round.billings -= distributed;
        round.info.active = false;
        round.info.trainable = false;

        for (p, share) in credits {
            *self.balances.entry(p).or_default() += share;
        }
        self.pending.push(LedgerEvent::RoundSettled {
            round_id: id,
            payment,
        });
        Ok(())
    }

    fn update_encrypted_key(
        &mut self,
        caller: &Identity,
        id: RoundId,
        participant: Identity,
        wrapped_key: String,
    ) -> LedgerResult<()> {
        let round = self.round_mut(id)?;
        round.require_owner(caller)?;
        round.require_active()?;
        if !round.public_keys.contains_key(&participant) {
            return Err(LedgerError::Rejected(format!(
                "{participant} has not joined round {id}"
            )));
        }

        let iteration = round.info.iteration;
        round.encrypted_keys.insert(
            participant.clone(),
            PublishedKey {
                wrapped: wrapped_key,
                iteration,
            },
        );
        self.pending.push(LedgerEvent::EncryptedKeyPublished {
            round_id: id,
            participant,
            iteration,
        });
        Ok(())
    }
}

/// Shared in-memory contract state.
pub struct MemoryChain {
    state: Mutex<ChainState>,
    events: broadcast::Sender<LedgerEvent>,
    quorum: usize,
}

impl MemoryChain {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            state: Mutex::new(ChainState::default()),
            events,
            quorum: 1,
        }
    }

    /// Uploads only complete an iteration once at least `quorum` trainers
    /// have joined it.
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum.max(1);
        self
    }

    /// Handle that signs as `identity`.
    pub fn connect(self: &Arc<Self>, identity: Identity) -> MemoryLedger {
        MemoryLedger {
            chain: Arc::clone(self),
            identity,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    /// Next sequence number `account` must use.
    pub async fn nonce_of(&self, account: &Identity) -> u64 {
        self.state
            .lock()
            .await
            .nonces
            .get(account)
            .copied()
            .unwrap_or(0)
    }

    pub async fn round_count(&self) -> usize {
        self.state.lock().await.rounds.len()
    }

    async fn apply<T, F>(&self, account: &Identity, nonce: u64, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut ChainState) -> LedgerResult<T>,
    {
        let mut state = self.state.lock().await;

        let expected = state.nonces.get(account).copied().unwrap_or(0);
        if nonce != expected {
            return Err(LedgerError::StaleNonce {
                account: account.clone(),
                expected,
                got: nonce,
            });
        }
        // reverted transactions still consume their sequence number
        state.nonces.insert(account.clone(), expected + 1);

        let result = op(&mut state);
        let events = std::mem::take(&mut state.pending);
        drop(state);

        if result.is_ok() {
            for event in events {
                debug!(kind = event.kind(), round_id = event.round_id(), "ledger event");
                // no subscribers is not an error
                let _ = self.events.send(event);
            }
        }
        result
    }
}

/// One account's connection to a [`MemoryChain`].
#[derive(Clone)]
pub struct MemoryLedger {
    chain: Arc<MemoryChain>,
    identity: Identity,
}

impl MemoryLedger {
    pub fn chain(&self) -> &Arc<MemoryChain> {
        &self.chain
    }

    async fn transact<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut ChainState) -> LedgerResult<T> + Send,
    {
        let nonce = self.chain.nonce_of(&self.identity).await;
        // signing and propagation happen between reading the nonce and inclusion
        tokio::task::yield_now().await;
        self.chain.apply(&self.identity, nonce, op).await
    }

    async fn query<T, F>(&self, read: F) -> LedgerResult<T>
    where
        F: FnOnce(&ChainState) -> LedgerResult<T> + Send,
    {
        let state = self.chain.state.lock().await;
        read(&state)
    }
}

impl Ledger for MemoryLedger {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn create(
        &self,
        architecture: ContentAddress,
        weights: ContentAddress,
        fee: u64,
        owner_public_key: String,
    ) -> LedgerResult<RoundId> {
        let caller = self.identity.clone();
        self.transact(move |s| s.create(&caller, architecture, weights, fee, owner_public_key))
            .await
    }

    async fn join(&self, round_id: RoundId, public_key: String, fee_payment: u64) -> LedgerResult<()> {
        let caller = self.identity.clone();
        self.transact(move |s| s.join(&caller, round_id, public_key, fee_payment))
            .await
    }

    async fn local_upload(&self, round_id: RoundId, update: ContentAddress) -> LedgerResult<()> {
        let caller = self.identity.clone();
        let quorum = self.chain.quorum;
        self.transact(move |s| s.local_upload(&caller, round_id, update, quorum))
            .await
    }

    async fn update_global_model(
        &self,
        round_id: RoundId,
        weights: ContentAddress,
        incentives: Vec<u64>,
    ) -> LedgerResult<()> {
        let caller = self.identity.clone();
        self.transact(move |s| s.update_global_model(&caller, round_id, weights, incentives))
            .await
    }

    async fn whether_continue(&self, round_id: RoundId, proceed: bool) -> LedgerResult<()> {
        let caller = self.identity.clone();
        self.transact(move |s| s.whether_continue(&caller, round_id, proceed))
            .await
    }

    async fn settle_billings(&self, round_id: RoundId, payment: u64) -> LedgerResult<()> {
        let caller = self.identity.clone();
        self.transact(move |s| s.settle_billings(&caller, round_id, payment))
            .await
    }

    async fn update_encrypted_key(
        &self,
        round_id: RoundId,
        participant: Identity,
        wrapped_key: String,
    ) -> LedgerResult<()> {
        let caller = self.identity.clone();
        self.transact(move |s| s.update_encrypted_key(&caller, round_id, participant, wrapped_key))
            .await
    }

    async fn local_models(&self, round_id: RoundId) -> LedgerResult<Vec<ContentAddress>> {
        self.query(|s| {
            let round = s.round(round_id)?;
            Ok(round
                .trainers
                .iter()
                .filter_map(|t| round.uploads.get(t).cloned())
                .collect())
        })
        .await
    }

    async fn announcements(&self, round_id: RoundId) -> LedgerResult<Vec<(Identity, String)>> {
        self.query(|s| {
            let round = s.round(round_id)?;
            Ok(round
                .trainers
                .iter()
                .filter_map(|t| round.public_keys.get(t).map(|pk| (t.clone(), pk.clone())))
                .collect())
        })
        .await
    }

    async fn trainers(&self, round_id: RoundId) -> LedgerResult<Vec<Identity>> {
        self.query(|s| {
            let round = s.round(round_id)?;
            Ok(round
                .trainers
                .iter()
                .filter(|t| round.uploads.contains_key(*t))
                .cloned()
                .collect())
        })
        .await
    }

    async fn round(&self, round_id: RoundId) -> LedgerResult<RoundInfo> {
        self.query(|s| Ok(s.round(round_id)?.info.clone())).await
    }

    async fn billings(&self, round_id: RoundId) -> LedgerResult<u64> {
        self.query(|s| Ok(s.round(round_id)?.billings)).await
    }

    async fn balance_of(&self, identity: &Identity) -> LedgerResult<u64> {
        self.query(|s| Ok(s.balances.get(identity).copied().unwrap_or(0)))
            .await
    }

    async fn encrypted_key(
        &self,
        round_id: RoundId,
        participant: &Identity,
    ) -> LedgerResult<Option<PublishedKey>> {
        self.query(|s| Ok(s.round(round_id)?.encrypted_keys.get(participant).cloned()))
            .await
    }

    async fn owner_public_key(&self, round_id: RoundId) -> LedgerResult<String> {
        self.query(|s| Ok(s.round(round_id)?.owner_public_key.clone()))
            .await
    }

    fn subscribe(&self) -> Subscription {
        self.chain.subscribe()
    }
}
