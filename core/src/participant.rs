//! Participant side of a round.
//!
//! Per iteration: join (paying the fee once), wait for the wrapped round key,
//! unwrap it, decrypt the global model, train locally, then upload the
//! update sealed under a key derived from the pairwise secret.

use std::sync::Arc;

use fedledger_blob::{BlobError, ObjectStore, load_cleartext, load_weights, store_weights};
use fedledger_keys::{CryptoError, CryptoSession, WrappedKey, unwrap_key};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ledger::{Delivery, Identity, Ledger, LedgerError, LedgerEvent, RoundId, Subscription};
use crate::trainer::{Trainer, TrainerError};

#[derive(Error, Debug)]
pub enum ParticipantError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("blob: {0}")]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Trainer(#[from] TrainerError),

    #[error("no wrapped key published for {0}")]
    MissingKey(Identity),

    #[error("event stream closed")]
    EventStreamClosed,

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ParticipantError>;

/// Iterations this participant trained in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantReport {
    pub identity: Identity,
    pub trained: Vec<u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum Wake {
    Ready,
    Settled,
}

/// What the participant is waiting for.
#[derive(Debug, Clone, Copy)]
enum Stage {
    /// The round accepts joins again
    Open,
    /// Our wrapped key for this iteration
    Key(u64),
    /// A global model newer than this iteration
    Global(u64),
}

impl Stage {
    fn wake_on(self, me: &Identity, event: &LedgerEvent) -> Option<Wake> {
        match (self, event) {
            (_, LedgerEvent::RoundSettled { .. }) => Some(Wake::Settled),
            (Stage::Open, LedgerEvent::TrainableChanged { trainable: true, .. }) => {
                Some(Wake::Ready)
            }
            (
                Stage::Key(iteration),
                LedgerEvent::EncryptedKeyPublished {
                    participant,
                    iteration: at,
                    ..
                },
            ) if participant == me && *at == iteration => Some(Wake::Ready),
            (Stage::Global(iteration), LedgerEvent::GlobalModelUpdated { iteration: at, .. })
                if *at > iteration =>
            {
                Some(Wake::Ready)
            }
            _ => None,
        }
    }
}

pub struct Participant<L: Ledger, S: ObjectStore, T: Trainer> {
    ledger: Arc<L>,
    store: Arc<S>,
    trainer: Arc<T>,
    session: CryptoSession,
    round_id: RoundId,
}

impl<L: Ledger, S: ObjectStore, T: Trainer> Participant<L, S, T> {
    pub fn new(
        ledger: Arc<L>,
        store: Arc<S>,
        trainer: Arc<T>,
        session: CryptoSession,
        round_id: RoundId,
    ) -> Self {
        Self {
            ledger,
            store,
            trainer,
            session,
            round_id,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.ledger.identity()
    }

    /// Trains every iteration until the round settles.
    pub async fn run(self) -> Result<ParticipantReport> {
        let round_id = self.round_id;
        let me = self.identity().clone();
        // subscribe before reading state so no transition is missed
        let mut events = self.ledger.subscribe();

        let owner_key = self.ledger.owner_public_key(round_id).await?;
        let secret = self.session.derive(&owner_key)?;
        let update_key = secret.update_key()?;

        let info = self.ledger.round(round_id).await?;
        let architecture = load_cleartext(self.store.as_ref(), &info.architecture).await?;
        let shape = self.trainer.import_architecture(&architecture)?;

        let mut paid = false;
        let mut trained = Vec::new();

        loop {
            let info = self.ledger.round(round_id).await?;
            if !info.active {
                break;
            }
            if !info.trainable {
                match self.wait(&mut events, Stage::Open).await? {
                    Wake::Ready => continue,
                    Wake::Settled => break,
                }
            }

            let fee = if paid { 0 } else { info.fee };
            match self
                .ledger
                .join(round_id, self.session.public_key_hex(), fee)
                .await
            {
                Ok(()) => paid = true,
                Err(LedgerError::Rejected(reason)) => {
                    debug!(round_id, participant = %me, %reason, "join rejected, waiting");
                    match self.wait(&mut events, Stage::Open).await? {
                        Wake::Ready => continue,
                        Wake::Settled => break,
                    }
                }
                Err(e) => return Err(e.into()),
            }

            let iteration = info.iteration;
            if let Wake::Settled = self.wait(&mut events, Stage::Key(iteration)).await? {
                break;
            }

            let wrapped = self
                .ledger
                .encrypted_key(round_id, &me)
                .await?
                .ok_or_else(|| ParticipantError::MissingKey(me.clone()))?;
            let round_key = unwrap_key(&WrappedKey::from_hex(&wrapped.wrapped)?, &secret)?;

            let global =
                load_weights(self.store.as_ref(), &info.global_weights, &round_key, &shape).await?;
            let trainer = Arc::clone(&self.trainer);
            let update = tokio::task::spawn_blocking(move || trainer.train(&global)).await??;

            let address = store_weights(self.store.as_ref(), &update, &update_key).await?;
            self.ledger.local_upload(round_id, address).await?;
            trained.push(iteration);
            info!(round_id, iteration, participant = %me, "update uploaded");

            if let Wake::Settled = self.wait(&mut events, Stage::Global(iteration)).await? {
                break;
            }
        }

        events.cancel();
        info!(round_id, participant = %me, iterations = trained.len(), "round finished");
        Ok(ParticipantReport {
            identity: me,
            trained,
        })
    }

    /// Consumes events for this round until one satisfies `stage`. When the
    /// stream lags the ledger is checked instead, since the event may be lost.
    async fn wait(&self, events: &mut Subscription, stage: Stage) -> Result<Wake> {
        loop {
            match events.next().await {
                Delivery::Event(event) if event.round_id() == self.round_id => {
                    if let Some(wake) = stage.wake_on(self.identity(), &event) {
                        return Ok(wake);
                    }
                }
                Delivery::Event(_) => {}
                Delivery::Lagged(missed) => {
                    warn!(round_id = self.round_id, missed, ?stage, "participant lagged behind events");
                    if let Some(wake) = self.recheck(stage).await? {
                        return Ok(wake);
                    }
                }
                Delivery::Closed | Delivery::Cancelled => {
                    return Err(ParticipantError::EventStreamClosed);
                }
            }
        }
    }

    async fn recheck(&self, stage: Stage) -> Result<Option<Wake>> {
        let info = self.ledger.round(self.round_id).await?;
        if !info.active {
            return Ok(Some(Wake::Settled));
        }
        let ready = match stage {
            Stage::Open => info.trainable,
            Stage::Key(iteration) => self
                .ledger
                .encrypted_key(self.round_id, self.identity())
                .await?
                .is_some_and(|k| k.iteration == iteration),
            Stage::Global(iteration) => info.iteration > iteration,
        };
        Ok(ready.then_some(Wake::Ready))
    }
}
