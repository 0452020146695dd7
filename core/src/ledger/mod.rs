//! Ledger interface.
//!
//! The ledger is the source of truth for round membership and state. Every
//! handle is bound to one account; state-changing calls are transactions
//! signed by that account and consume its sequence numbers.
//!
//! ```text
//!   coordinator ──┐                       ┌──► Subscription (coordinator)
//!   participant ──┼──► Ledger (per acct) ─┤
//!   participant ──┘         │             └──► Subscription (participants)
//!                           ▼
//!                  LedgerEvent broadcast
//! ```

mod memory;
mod types;

pub use memory::{MemoryChain, MemoryLedger};
pub use types::{Identity, LedgerEvent, PublishedKey, RoundId, RoundInfo};

use std::future::Future;
use std::time::Duration;

use fedledger_blob::ContentAddress;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("stale sequence number for {account}: expected {expected}, got {got}")]
    StaleNonce {
        account: Identity,
        expected: u64,
        got: u64,
    },

    #[error("unknown round {0}")]
    UnknownRound(RoundId),

    /// The contract reverted the call
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("inconsistent ledger state: {0}")]
    Inconsistent(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

pub trait Ledger: Send + Sync + 'static {
    /// Account this handle signs for.
    fn identity(&self) -> &Identity;

    fn create(
        &self,
        architecture: ContentAddress,
        weights: ContentAddress,
        fee: u64,
        owner_public_key: String,
    ) -> impl Future<Output = LedgerResult<RoundId>> + Send;

    fn join(
        &self,
        round_id: RoundId,
        public_key: String,
        fee_payment: u64,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn local_upload(
        &self,
        round_id: RoundId,
        update: ContentAddress,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn update_global_model(
        &self,
        round_id: RoundId,
        weights: ContentAddress,
        incentives: Vec<u64>,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn whether_continue(
        &self,
        round_id: RoundId,
        proceed: bool,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn settle_billings(
        &self,
        round_id: RoundId,
        payment: u64,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    fn update_encrypted_key(
        &self,
        round_id: RoundId,
        participant: Identity,
        wrapped_key: String,
    ) -> impl Future<Output = LedgerResult<()>> + Send;

    /// Update refs of the current iteration, ordered like [`Ledger::trainers`].
    fn local_models(
        &self,
        round_id: RoundId,
    ) -> impl Future<Output = LedgerResult<Vec<ContentAddress>>> + Send;

    /// Joiners of the current iteration with the public keys they announced,
    /// in join order.
    fn announcements(
        &self,
        round_id: RoundId,
    ) -> impl Future<Output = LedgerResult<Vec<(Identity, String)>>> + Send;

    fn trainers(&self, round_id: RoundId)
    -> impl Future<Output = LedgerResult<Vec<Identity>>> + Send;

    fn round(&self, round_id: RoundId) -> impl Future<Output = LedgerResult<RoundInfo>> + Send;

    fn billings(&self, round_id: RoundId) -> impl Future<Output = LedgerResult<u64>> + Send;

    fn balance_of(&self, identity: &Identity) -> impl Future<Output = LedgerResult<u64>> + Send;

    fn encrypted_key(
        &self,
        round_id: RoundId,
        participant: &Identity,
    ) -> impl Future<Output = LedgerResult<Option<PublishedKey>>> + Send;

    fn owner_public_key(
        &self,
        round_id: RoundId,
    ) -> impl Future<Output = LedgerResult<String>> + Send;

    fn subscribe(&self) -> Subscription;
}

/// What a subscription yields next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(LedgerEvent),
    /// The receiver fell behind and lost this many events
    Lagged(u64),
    /// Every sender is gone
    Closed,
    Cancelled,
}

/// Event stream with a cancellation handle.
pub struct Subscription {
    rx: broadcast::Receiver<LedgerEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<LedgerEvent>) -> Self {
        Self {
            rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next(&mut self) -> Delivery {
        if self.cancel.is_cancelled() {
            return Delivery::Cancelled;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Delivery::Cancelled,
            res = self.rx.recv() => match res {
                Ok(event) => Delivery::Event(event),
                Err(RecvError::Lagged(n)) => Delivery::Lagged(n),
                Err(RecvError::Closed) => Delivery::Closed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(round_id: RoundId) -> LedgerEvent {
        LedgerEvent::UpdateFinished {
            round_id,
            iteration: 1,
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::new(rx);

        tx.send(finished(1)).unwrap();
        tx.send(finished(2)).unwrap();

        assert_eq!(sub.next().await, Delivery::Event(finished(1)));
        assert_eq!(sub.next().await, Delivery::Event(finished(2)));
    }

    #[tokio::test]
    async fn lagging_receiver_is_told_how_far() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);

        for id in 0..5 {
            tx.send(finished(id)).unwrap();
        }

        assert_eq!(sub.next().await, Delivery::Lagged(3));
        assert_eq!(sub.next().await, Delivery::Event(finished(3)));
    }

    #[tokio::test]
    async fn closed_and_cancelled() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);
        drop(tx);
        assert_eq!(sub.next().await, Delivery::Closed);

        let (_tx, rx) = broadcast::channel::<LedgerEvent>(2);
        let mut sub = Subscription::new(rx);
        sub.cancel_token().cancel();
        assert_eq!(sub.next().await, Delivery::Cancelled);
    }
}
