//! Round Coordinator
//!
//! Drives one federated-learning round from the owner's side, reacting to
//! ledger events.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           Round Coordinator                            │
//! │                                                                        │
//! │  ┌─────────┐    ┌─────────────────┐    ┌─────────────┐    ┌──────────┐ │
//! │  │ Created │───▶│ AwaitingUpdates │───▶│ Aggregating │───▶│ Settling │ │
//! │  └─────────┘    └─────────────────┘    └─────────────┘    └──────────┘ │
//! │                     ▲        │                │                 │      │
//! │                     │   KeyAnnounced          ▼                 ▼      │
//! │                     │        │         ┌────────────┐     ┌──────────┐ │
//! │                     │        ▼         │ Continuing │     │  Closed  │ │
//! │                     │  KeyDistributor  └────────────┘     └──────────┘ │
//! │                     └────────────────────────┘                         │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Key distribution runs on spawned tasks; the aggregation cycle runs inline
//! on the event task, so round state is only ever mutated there.

mod cycle;
mod error;
pub mod key_distributor;

#[cfg(test)]
mod tests;

pub use cycle::CycleReport;
pub use error::{CoordinatorError, Result};
pub use key_distributor::{KeyDistributor, LaneGuard};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fedledger_blob::{ContentAddress, ObjectStore, store_cleartext, store_weights};
use fedledger_keys::{CryptoSession, SymmetricKey};
use fedledger_weights::{ModelShape, WeightCollection};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::ledger::{Delivery, Identity, Ledger, LedgerEvent, RoundId, Subscription};
use crate::trainer::Trainer;

// Configuration

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Group size of the attribution tree
    pub group_size: usize,
    /// Completed aggregation cycles after which the round settles
    pub max_iterations: u64,
    /// Weight incentives by approximate Shapley value
    pub attribution: bool,
    /// Fresh round key per aggregation cycle
    pub rotate_key: bool,
    pub one_time_fee: u64,
    /// Fraction of collected fees paid out on settlement
    pub settlement_share: f64,
    /// Units distributed per cycle when attribution is on
    pub incentive_pool: u64,
    pub ledger_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            group_size: 2,
            max_iterations: 3,
            attribution: false,
            rotate_key: true,
            one_time_fee: 10,
            settlement_share: 0.1,
            incentive_pool: 100,
            ledger_timeout: Duration::from_secs(30),
        }
    }
}

// Round State

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Created,
    AwaitingUpdates,
    Aggregating,
    Continuing,
    Settling,
    Closed,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub identity: Identity,
    pub public_key: String,
    /// Update submitted for the current iteration
    pub update: Option<ContentAddress>,
}

/// Coordinator-side view of a round.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub id: RoundId,
    pub owner: Identity,
    pub architecture: ContentAddress,
    pub global_weights: ContentAddress,
    pub shape: ModelShape,
    pub iteration: u64,
    pub active: bool,
    pub phase: RoundPhase,
    pub participants: BTreeMap<Identity, ParticipantRecord>,
}

/// What the event task does in response to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Ignore,
    Distribute {
        participant: Identity,
        public_key: String,
    },
    Aggregate {
        iteration: u64,
    },
}

impl Round {
    /// Applies `event` to the round and returns the work it triggers.
    pub fn on_event(&mut self, event: &LedgerEvent) -> Action {
        if event.round_id() != self.id || !self.active {
            return Action::Ignore;
        }

        match event {
            LedgerEvent::KeyAnnounced {
                participant,
                public_key,
                ..
            } => {
                self.participants
                    .entry(participant.clone())
                    .and_modify(|p| p.public_key = public_key.clone())
                    .or_insert_with(|| ParticipantRecord {
                        identity: participant.clone(),
                        public_key: public_key.clone(),
                        update: None,
                    });
                Action::Distribute {
                    participant: participant.clone(),
                    public_key: public_key.clone(),
                }
            }
            LedgerEvent::UpdateFinished { iteration, .. }
                if self.phase == RoundPhase::AwaitingUpdates && *iteration == self.iteration =>
            {
                self.phase = RoundPhase::Aggregating;
                Action::Aggregate {
                    iteration: *iteration,
                }
            }
            _ => Action::Ignore,
        }
    }
}

/// Snapshot returned by [`CoordinatorHandle::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct RoundStatus {
    pub round_id: RoundId,
    pub phase: RoundPhase,
    pub iteration: u64,
    pub participants: usize,
    pub stop_requested: bool,
}

/// Outcome of a finished round.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round_id: RoundId,
    pub cycles: Vec<CycleReport>,
    pub final_weights: ContentAddress,
    /// Amount paid out on settlement
    pub payment: Option<u64>,
}

// Coordinator Commands

pub enum Command {
    /// Settle at the next aggregation boundary
    Stop,
    Status(oneshot::Sender<RoundStatus>),
}

// Coordinator

pub struct Coordinator<L: Ledger, S: ObjectStore, T: Trainer> {
    config: CoordinatorConfig,
    ledger: Arc<L>,
    store: Arc<S>,
    trainer: Arc<T>,
    keys: Arc<KeyDistributor<L>>,
    round: Round,
    events: Subscription,
    stop_requested: bool,
    cycles: Vec<CycleReport>,
    payment: Option<u64>,
}

impl<L: Ledger, S: ObjectStore, T: Trainer> Coordinator<L, S, T> {
    /// Publishes the architecture and sealed initial weights, then registers
    /// the round on the ledger.
    pub async fn create(
        config: CoordinatorConfig,
        ledger: Arc<L>,
        store: Arc<S>,
        trainer: Arc<T>,
        session: CryptoSession,
        initial: WeightCollection,
    ) -> Result<Self> {
        // subscribe first so nothing emitted by `create` is missed
        let events = ledger.subscribe();

        let shape = trainer.model_shape();
        shape.check(&initial)?;

        let round_key = SymmetricKey::generate();
        let architecture = store_cleartext(store.as_ref(), trainer.export_architecture()).await?;
        let global_weights = store_weights(store.as_ref(), &initial, &round_key).await?;

        let session = Arc::new(session);
        let call = ledger.create(
            architecture.clone(),
            global_weights.clone(),
            config.one_time_fee,
            session.public_key_hex(),
        );
        let round_id = match tokio::time::timeout(config.ledger_timeout, call).await {
            Ok(res) => res?,
            Err(_) => return Err(crate::ledger::LedgerError::Timeout(config.ledger_timeout).into()),
        };

        let mut round = Round {
            id: round_id,
            owner: ledger.identity().clone(),
            architecture,
            global_weights,
            shape,
            iteration: 1,
            active: true,
            phase: RoundPhase::Created,
            participants: BTreeMap::new(),
        };
        info!(round_id, shape = %round.shape, fee = config.one_time_fee, "round created");
        round.phase = RoundPhase::AwaitingUpdates;

        let keys = Arc::new(KeyDistributor::new(
            Arc::clone(&ledger),
            session,
            round_id,
            round_key,
            config.ledger_timeout,
        ));

        Ok(Self {
            config,
            ledger,
            store,
            trainer,
            keys,
            round,
            events,
            stop_requested: false,
            cycles: Vec::new(),
            payment: None,
        })
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn keys(&self) -> &Arc<KeyDistributor<L>> {
        &self.keys
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn status(&self) -> RoundStatus {
        RoundStatus {
            round_id: self.round.id,
            phase: self.round.phase,
            iteration: self.round.iteration,
            participants: self.round.participants.len(),
            stop_requested: self.stop_requested,
        }
    }

    fn summary(&self) -> RoundSummary {
        RoundSummary {
            round_id: self.round.id,
            cycles: self.cycles.clone(),
            final_weights: self.round.global_weights.clone(),
            payment: self.payment,
        }
    }

    /// Handles one delivered event. Aggregation runs to completion here.
    pub async fn handle_event(
        &mut self,
        event: LedgerEvent,
        distributions: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        match self.round.on_event(&event) {
            Action::Ignore => {
                debug!(round_id = self.round.id, kind = event.kind(), "event ignored");
            }
            Action::Distribute {
                participant,
                public_key,
            } => {
                let keys = Arc::clone(&self.keys);
                distributions.spawn(async move { keys.distribute_to(participant, &public_key).await });
            }
            Action::Aggregate { iteration } => {
                info!(round_id = self.round.id, iteration, "all updates in, aggregating");
                let report = self.aggregation_cycle().await?;
                self.cycles.push(report);

                let done = self.cycles.len() as u64 >= self.config.max_iterations;
                if self.stop_requested || done {
                    self.settle().await?;
                } else {
                    self.proceed().await?;
                }
            }
        }
        Ok(())
    }

    /// Rebuilds from ledger state what dropped events would have carried:
    /// key announcements of the current iteration and a finished upload set.
    pub async fn reconcile(&mut self, distributions: &mut JoinSet<Result<()>>) -> Result<()> {
        let round_id = self.round.id;
        let info = self.keys.bounded(self.ledger.round(round_id)).await?;
        if !info.active {
            return Ok(());
        }
        let announced = self.keys.bounded(self.ledger.announcements(round_id)).await?;
        let uploaded = self.keys.bounded(self.ledger.trainers(round_id)).await?;

        for (participant, public_key) in announced {
            let replay = LedgerEvent::KeyAnnounced {
                round_id,
                participant,
                public_key,
            };
            let Action::Distribute {
                participant,
                public_key,
            } = self.round.on_event(&replay)
            else {
                continue;
            };

            let published = self
                .keys
                .bounded(self.ledger.encrypted_key(round_id, &participant))
                .await?
                .is_some_and(|k| k.iteration == info.iteration);
            // the aggregation below needs secrets cached before it runs, so
            // nothing here goes through the distribution tasks
            let res = if published || uploaded.contains(&participant) {
                self.keys.recover(&participant, &public_key).await
            } else {
                self.keys.distribute_to(participant.clone(), &public_key).await
            };
            if let Err(e) = res {
                warn!(round_id, participant = %participant, error = %e, "key recovery failed");
            }
        }

        if !info.trainable {
            let replay = LedgerEvent::UpdateFinished {
                round_id,
                iteration: info.iteration,
            };
            self.handle_event(replay, distributions).await?;
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        phase: watch::Sender<RoundPhase>,
    ) -> Result<RoundSummary> {
        let round_id = self.round.id;
        let mut distributions = JoinSet::new();
        phase.send_replace(self.round.phase);

        loop {
            tokio::select! {
                biased;
                Some(cmd) = commands.recv() => match cmd {
                    Command::Stop => {
                        info!(round_id, "stop requested, settling at the next boundary");
                        self.stop_requested = true;
                    }
                    Command::Status(reply) => {
                        let _ = reply.send(self.status());
                    }
                },
                Some(joined) = distributions.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(round_id, error = %e, "key distribution failed"),
                    Err(e) => error!(round_id, error = %e, "key distribution task panicked"),
                },
                delivery = self.events.next() => {
                    let res = match delivery {
                        Delivery::Event(event) => self.handle_event(event, &mut distributions).await,
                        Delivery::Lagged(missed) => {
                            warn!(round_id, missed, "event stream lagged, reconciling with ledger");
                            self.reconcile(&mut distributions).await
                        }
                        Delivery::Closed => return Err(CoordinatorError::EventStreamClosed),
                        Delivery::Cancelled => break,
                    };
                    phase.send_replace(self.round.phase);
                    if let Err(e) = res {
                        error!(round_id, phase = %self.round.phase, error = %e, "round stalled");
                        return Err(e);
                    }
                    if self.round.phase == RoundPhase::Closed {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = distributions.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(round_id, error = %e, "key distribution failed");
            }
        }

        info!(round_id, cycles = self.cycles.len(), "round closed");
        Ok(self.summary())
    }

    /// Runs the coordinator on its own task.
    pub fn spawn(self) -> CoordinatorHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (phase_tx, phase_rx) = watch::channel(self.round.phase);
        let round_id = self.round.id;

        let task = tokio::spawn(self.run(command_rx, phase_tx));

        CoordinatorHandle {
            round_id,
            commands: command_tx,
            phase: phase_rx,
            task,
        }
    }
}

// Coordinator Handle

pub struct CoordinatorHandle {
    round_id: RoundId,
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<RoundPhase>,
    task: JoinHandle<Result<RoundSummary>>,
}

impl CoordinatorHandle {
    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn phase(&self) -> RoundPhase {
        *self.phase.borrow()
    }

    /// Asks the round to settle after the next aggregation cycle.
    pub async fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .await
            .map_err(|_| CoordinatorError::Task("coordinator unavailable".into()))
    }

    pub async fn status(&self) -> Result<RoundStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Status(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Task("coordinator unavailable".into()))?;
        reply_rx
            .await
            .map_err(|_| CoordinatorError::Task("coordinator crashed".into()))
    }

    /// Waits until the round reaches `target`.
    pub async fn wait_for(&mut self, target: RoundPhase) -> Result<()> {
        self.phase
            .wait_for(|p| *p == target)
            .await
            .map(|_| ())
            .map_err(|_| CoordinatorError::Task("coordinator exited".into()))
    }

    pub async fn join(self) -> Result<RoundSummary> {
        self.task.await?
    }
}
