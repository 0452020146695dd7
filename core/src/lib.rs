//! Federated-learning round coordination over a ledger.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        fedledger-core                         │
//! │                                                               │
//! │  ┌─────────────┐   events   ┌──────────────────────────────┐ │
//! │  │   Ledger    │──────────▶│       RoundCoordinator        │ │
//! │  │ (MemoryChain│◀──────────│  KeyDistributor │ aggregation │ │
//! │  │  or remote) │   calls    └──────────────┬───────────────┘ │
//! │  └─────────────┘                           │                 │
//! │        ▲                                   ▼                 │
//! │        │ join/upload           ┌──────────────────────┐      │
//! │  ┌─────┴───────┐   sealed blobs│     ObjectStore      │      │
//! │  │ Participant │──────────────▶│  (content-addressed) │      │
//! │  └─────────────┘               └──────────────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
pub mod ledger;
pub mod participant;
pub mod trainer;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorHandle, RoundPhase, RoundSummary,
};
pub use ledger::{Identity, Ledger, LedgerEvent, MemoryChain, MemoryLedger, RoundId};
pub use participant::{Participant, ParticipantError, ParticipantReport};
pub use trainer::{LinearTrainer, Trainer, TrainerError};
