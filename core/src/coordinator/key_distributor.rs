//! Round-key distribution.
//!
//! Every ledger submission the coordinator account makes goes through one
//! lane (a `tokio::sync::Mutex`) so that sequence numbers are consumed one
//! call at a time. The lane also owns the current round key, which makes
//! rotation and distribution mutually exclusive.
//!
//! ```text
//!   KeyAnnounced ─┐
//!   KeyAnnounced ─┼─► distribute_to ─► lane ─► derive/cache ─► wrap ─► updateEncryptedKey
//!   aggregation  ─┘                     │
//!                                       └─► updateGlobalModel, rotate
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fedledger_keys::{CryptoSession, SharedSecret, SymmetricKey, wrap_key};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::Result;
use crate::ledger::{Identity, Ledger, LedgerError, LedgerResult, RoundId};

/// Exclusive access to the coordinator's submission lane.
pub struct LaneGuard<'a> {
    key: MutexGuard<'a, SymmetricKey>,
}

impl LaneGuard<'_> {
    pub fn round_key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Replaces the round key; later distributions wrap the new one.
    pub fn rotate(&mut self, key: SymmetricKey) {
        *self.key = key;
    }
}

/// Pairwise secret and the public key it was derived from.
#[derive(Clone)]
struct CachedSecret {
    public_key: String,
    secret: SharedSecret,
}

pub struct KeyDistributor<L: Ledger> {
    ledger: Arc<L>,
    session: Arc<CryptoSession>,
    round_id: RoundId,
    lane: Mutex<SymmetricKey>,
    /// identity -> pairwise secret, append-only
    cache: DashMap<Identity, CachedSecret>,
    timeout: Duration,
}

impl<L: Ledger> KeyDistributor<L> {
    pub fn new(
        ledger: Arc<L>,
        session: Arc<CryptoSession>,
        round_id: RoundId,
        round_key: SymmetricKey,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            session,
            round_id,
            lane: Mutex::new(round_key),
            cache: DashMap::new(),
            timeout,
        }
    }

    pub async fn lane(&self) -> LaneGuard<'_> {
        LaneGuard {
            key: self.lane.lock().await,
        }
    }

    /// Snapshot of the current round key.
    pub async fn round_key(&self) -> SymmetricKey {
        self.lane.lock().await.clone()
    }

    /// Awaits a ledger call, failing with [`LedgerError::Timeout`] once the
    /// configured bound elapses.
    pub async fn bounded<T>(&self, call: impl Future<Output = LedgerResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(LedgerError::Timeout(self.timeout).into()),
        }
    }

    /// Cached secret for `identity`, deriving it from `public_key` on first
    /// use. Only callable while holding the lane.
    ///
    /// The cache is append-only: a later announcement under a different key
    /// keeps the first secret.
    fn secret_for(
        &self,
        _lane: &LaneGuard<'_>,
        identity: &Identity,
        public_key: &str,
    ) -> Result<SharedSecret> {
        if let Some(cached) = self.cache.get(identity) {
            if cached.public_key != public_key {
                warn!(
                    round_id = self.round_id,
                    participant = %identity,
                    "public key changed since first announcement, keeping cached secret"
                );
            }
            return Ok(cached.secret.clone());
        }
        let secret = self.session.derive(public_key)?;
        self.cache.insert(
            identity.clone(),
            CachedSecret {
                public_key: public_key.to_string(),
                secret: secret.clone(),
            },
        );
        debug!(round_id = self.round_id, participant = %identity, "derived pairwise secret");
        Ok(secret)
    }

    /// Wraps the current round key for `identity` and publishes it.
    pub async fn distribute_to(&self, identity: Identity, public_key: &str) -> Result<()> {
        let lane = self.lane().await;

        let secret = self.secret_for(&lane, &identity, public_key)?;
        let wrapped = wrap_key(lane.round_key(), &secret)?;

        self.bounded(self.ledger.update_encrypted_key(
            self.round_id,
            identity.clone(),
            wrapped.to_hex(),
        ))
        .await?;

        info!(round_id = self.round_id, participant = %identity, "round key distributed");
        Ok(())
    }

    /// Derives and caches the secret for `identity` without publishing a key.
    pub async fn recover(&self, identity: &Identity, public_key: &str) -> Result<()> {
        let lane = self.lane().await;
        self.secret_for(&lane, identity, public_key).map(|_| ())
    }

    pub fn pairwise_secret(&self, identity: &Identity) -> Option<SharedSecret> {
        self.cache.get(identity).map(|c| c.secret.clone())
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
