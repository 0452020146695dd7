use std::fmt;

use fedledger_blob::ContentAddress;

/// Sequential round identifier, assigned by the ledger from 0.
pub type RoundId = u64;

/// Ledger account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Public view of a round as the ledger stores it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundInfo {
    pub id: RoundId,
    pub owner: Identity,
    pub architecture: ContentAddress,
    pub global_weights: ContentAddress,
    /// Starts at 1, +1 per completed aggregation
    pub iteration: u64,
    pub fee: u64,
    pub active: bool,
    /// Whether joins and uploads are accepted
    pub trainable: bool,
}

/// A wrapped round key and the iteration it was published in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedKey {
    pub wrapped: String,
    pub iteration: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    GlobalModelUpdated {
        round_id: RoundId,
        iteration: u64,
        weights: ContentAddress,
    },
    KeyAnnounced {
        round_id: RoundId,
        participant: Identity,
        public_key: String,
    },
    EncryptedKeyPublished {
        round_id: RoundId,
        participant: Identity,
        iteration: u64,
    },
    UpdateFinished {
        round_id: RoundId,
        iteration: u64,
    },
    TrainableChanged {
        round_id: RoundId,
        trainable: bool,
    },
    RoundSettled {
        round_id: RoundId,
        payment: u64,
    },
}

impl LedgerEvent {
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::GlobalModelUpdated { round_id, .. }
            | Self::KeyAnnounced { round_id, .. }
            | Self::EncryptedKeyPublished { round_id, .. }
            | Self::UpdateFinished { round_id, .. }
            | Self::TrainableChanged { round_id, .. }
            | Self::RoundSettled { round_id, .. } => *round_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::GlobalModelUpdated { .. } => "GlobalModelUpdated",
            Self::KeyAnnounced { .. } => "KeyAnnounced",
            Self::EncryptedKeyPublished { .. } => "EncryptedKeyPublished",
            Self::UpdateFinished { .. } => "UpdateFinished",
            Self::TrainableChanged { .. } => "TrainableChanged",
            Self::RoundSettled { .. } => "RoundSettled",
        }
    }
}
