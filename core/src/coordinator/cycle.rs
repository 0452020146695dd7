//! Aggregation cycle and the continue/settle decision that follows it.

use std::sync::Arc;

use fedledger_blob::{ContentAddress, ObjectStore, load_weights, store_weights};
use fedledger_keys::SymmetricKey;
use fedledger_weights::{WeightCollection, aggregate, attribute};
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{Coordinator, CoordinatorError, Result, RoundPhase};
use crate::ledger::{Identity, Ledger, LedgerError};
use crate::trainer::Trainer;

/// What one aggregation cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Iteration the aggregated updates were trained in
    pub iteration: u64,
    pub contributors: Vec<Identity>,
    pub skipped: Vec<Identity>,
    /// One entry per trainer, in ledger order; skipped trainers get 0
    pub incentives: Vec<u64>,
    /// Evaluation score of the new global model
    pub score: f64,
    pub weights: ContentAddress,
}

impl<L: Ledger, S: ObjectStore, T: Trainer> Coordinator<L, S, T> {
    /// Fetches, decrypts and aggregates the current iteration's updates and
    /// publishes the new global model.
    pub(super) async fn aggregation_cycle(&mut self) -> Result<CycleReport> {
        let round_id = self.round.id;
        let iteration = self.round.iteration;

        let trainers = self.keys.bounded(self.ledger.trainers(round_id)).await?;
        let refs = self.keys.bounded(self.ledger.local_models(round_id)).await?;
        if trainers.len() != refs.len() {
            return Err(LedgerError::Inconsistent(format!(
                "{} trainers but {} updates",
                trainers.len(),
                refs.len()
            ))
            .into());
        }
        for (identity, address) in trainers.iter().zip(&refs) {
            if let Some(record) = self.round.participants.get_mut(identity) {
                record.update = Some(address.clone());
            }
        }

        // one retrieval per trainer, joined before aggregation
        let store = self.store.as_ref();
        let keys = self.keys.as_ref();
        let shape = &self.round.shape;
        let loads = trainers.iter().zip(&refs).map(|(identity, address)| async move {
            let secret = keys.pairwise_secret(identity).ok_or_else(|| {
                CoordinatorError::InvalidKeyMaterial(format!("no shared secret for {identity}"))
            })?;
            let key = secret.update_key()?;
            Ok::<_, CoordinatorError>(load_weights(store, address, &key, shape).await?)
        });
        let loaded = join_all(loads).await;

        let mut contributors = Vec::new();
        let mut skipped = Vec::new();
        let mut updates = Vec::new();
        for (identity, res) in trainers.iter().zip(loaded) {
            match res {
                Ok(weights) => {
                    contributors.push(identity.clone());
                    updates.push(weights);
                }
                Err(e) => {
                    warn!(round_id, iteration, participant = %identity, error = %e, "skipping update");
                    skipped.push(identity.clone());
                }
            }
        }
        if updates.is_empty() {
            return Err(CoordinatorError::EmptyAggregationSet);
        }

        let scales = vec![1.0; updates.len()];
        let aggregated = aggregate(&updates, &scales)?;

        let trainer = Arc::clone(&self.trainer);
        let candidate = aggregated.clone();
        let score = tokio::task::spawn_blocking(move || trainer.evaluate(&candidate)).await??;

        let earned = if self.config.attribution {
            self.attribution_incentives(updates, scales).await?
        } else {
            vec![1; contributors.len()]
        };
        let mut earned = earned.into_iter();
        let incentives: Vec<u64> = trainers
            .iter()
            .map(|t| {
                if contributors.contains(t) {
                    earned.next().unwrap_or(0)
                } else {
                    0
                }
            })
            .collect();

        let next_key = if self.config.rotate_key {
            SymmetricKey::generate()
        } else {
            self.keys.round_key().await
        };
        let weights = store_weights(self.store.as_ref(), &aggregated, &next_key).await?;

        {
            let mut lane = self.keys.lane().await;
            self.keys
                .bounded(self.ledger.update_global_model(
                    round_id,
                    weights.clone(),
                    incentives.clone(),
                ))
                .await?;
            lane.rotate(next_key);
        }

        self.round.global_weights = weights.clone();
        self.round.iteration += 1;
        for record in self.round.participants.values_mut() {
            record.update = None;
        }

        info!(
            round_id,
            iteration,
            contributors = contributors.len(),
            skipped = skipped.len(),
            score,
            "global model updated"
        );

        Ok(CycleReport {
            iteration,
            contributors,
            skipped,
            incentives,
            score,
            weights,
        })
    }

    /// Incentive units per contribution, from approximate Shapley values
    /// measured against the current global model.
    async fn attribution_incentives(
        &self,
        updates: Vec<WeightCollection>,
        scales: Vec<f64>,
    ) -> Result<Vec<u64>> {
        let round_key = self.keys.round_key().await;
        let baseline = load_weights(
            self.store.as_ref(),
            &self.round.global_weights,
            &round_key,
            &self.round.shape,
        )
        .await?;

        let trainer = Arc::clone(&self.trainer);
        let group_size = self.config.group_size;
        let values = tokio::task::spawn_blocking(move || {
            attribute(
                |w| trainer.evaluate(w),
                &baseline,
                &updates,
                &scales,
                group_size,
                1.0,
            )
        })
        .await??;

        debug!(round_id = self.round.id, ?values, "attribution");

        let pool = self.config.incentive_pool as f64;
        Ok(values
            .iter()
            .map(|v| (v.max(0.0) * pool).round() as u64)
            .collect())
    }

    pub(super) async fn proceed(&mut self) -> Result<()> {
        self.round.phase = RoundPhase::Continuing;
        {
            let _lane = self.keys.lane().await;
            self.keys
                .bounded(self.ledger.whether_continue(self.round.id, true))
                .await?;
        }
        self.round.phase = RoundPhase::AwaitingUpdates;
        debug!(round_id = self.round.id, iteration = self.round.iteration, "round continues");
        Ok(())
    }

    /// Stops training and pays out `settlement_share` of the collected fees.
    pub(super) async fn settle(&mut self) -> Result<()> {
        let round_id = self.round.id;
        self.round.phase = RoundPhase::Settling;

        let payment = {
            let _lane = self.keys.lane().await;
            self.keys
                .bounded(self.ledger.whether_continue(round_id, false))
                .await?;
            let billings = self.keys.bounded(self.ledger.billings(round_id)).await?;
            let payment = (billings as f64 * self.config.settlement_share).round() as u64;
            self.keys
                .bounded(self.ledger.settle_billings(round_id, payment))
                .await?;
            payment
        };

        self.payment = Some(payment);
        self.round.active = false;
        self.round.phase = RoundPhase::Closed;
        self.events.cancel();

        info!(round_id, payment, "round settled");
        Ok(())
    }
}
