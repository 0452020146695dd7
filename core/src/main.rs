//! fedledger dev coordinator
//!
//! Runs one complete round locally: an in-memory chain and object store, a
//! coordinator and N simulated participants training a linear model.
//!
//! ```text
//!   coordinator ──┐                 ┌── participant-0
//!                 ├── MemoryChain ──┼── participant-1
//!   MemoryStore ──┘                 └── participant-N
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use fedledger_blob::MemoryStore;
use fedledger_config::FedConfig;
use fedledger_core::{
    Coordinator, CoordinatorConfig, Identity, Ledger, LinearTrainer, MemoryChain, Participant,
    Trainer,
};
use fedledger_keys::CryptoSession;
use fedledger_weights::WeightCollection;
use tokio::task::JoinSet;
use tracing::{info, warn};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "fedledger-coordinator")]
#[command(about = "Runs a federated-learning round against an in-memory ledger", long_about = None)]
struct Args {
    /// Config file (defaults to the standard lookup)
    #[arg(long, env = "FL_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated participants (overrides the config file)
    #[arg(long)]
    participants: Option<usize>,

    /// Aggregation cycles before settlement (overrides the config file)
    #[arg(long)]
    iterations: Option<u64>,

    /// Input features of the toy model
    #[arg(long, default_value = "4", env = "FL_MODEL_DIMS")]
    dims: usize,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FedConfig::load_from(path)?,
        None => FedConfig::load().context("failed to load configuration")?,
    };
    if let Some(n) = args.participants {
        config.coordinator.participants = n;
    }
    if let Some(n) = args.iterations {
        config.coordinator.max_iterations = n;
    }
    config.validate()?;
    FedConfig::init_global(config).map_err(|_| anyhow!("configuration already initialized"))?;
    let config = FedConfig::global();

    if !config.features.dev_mode {
        bail!("only the in-memory ledger is available; enable features.dev_mode");
    }

    let participants = config.coordinator.participants;
    let coordinator_config = CoordinatorConfig::from(config);
    info!(
        participants,
        max_iterations = coordinator_config.max_iterations,
        attribution = coordinator_config.attribution,
        "starting dev round"
    );

    let chain = Arc::new(MemoryChain::new(config.ledger.event_buffer).with_quorum(participants));
    let store = Arc::new(MemoryStore::new(config.store.chunk_size));

    let owner = Arc::new(chain.connect(Identity::new("owner")));
    let validator = LinearTrainer::new(args.dims, 0);
    let initial = WeightCollection::zeros(&validator.model_shape());

    let coordinator = Coordinator::create(
        coordinator_config,
        Arc::clone(&owner),
        Arc::clone(&store),
        Arc::new(validator),
        CryptoSession::generate(),
        initial,
    )
    .await
    .context("failed to create round")?;
    let round_id = coordinator.round().id;
    let handle = coordinator.spawn();

    let mut names = Vec::with_capacity(participants);
    let mut tasks = JoinSet::new();
    for i in 0..participants {
        let identity = Identity::new(format!("participant-{i}"));
        names.push(identity.clone());
        let participant = Participant::new(
            Arc::new(chain.connect(identity)),
            Arc::clone(&store),
            Arc::new(LinearTrainer::new(args.dims, i as u64 + 1)),
            CryptoSession::generate(),
            round_id,
        );
        tasks.spawn(participant.run());
    }

    let summary = handle.join().await.context("round failed")?;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(report)) => info!(
                participant = %report.identity,
                iterations = report.trained.len(),
                "participant finished"
            ),
            Ok(Err(e)) => warn!(error = %e, "participant failed"),
            Err(e) => warn!(error = %e, "participant task panicked"),
        }
    }

    for cycle in &summary.cycles {
        println!(
            "iteration {}: score {:.4}, incentives {:?}",
            cycle.iteration, cycle.score, cycle.incentives
        );
    }
    println!(
        "round {} settled, paid {}",
        summary.round_id,
        summary.payment.unwrap_or(0)
    );
    for identity in &names {
        println!("  {identity}: {}", owner.balance_of(identity).await?);
    }

    Ok(())
}
