//! Runtime configuration derived from the `fedledger-config` file layout.

use std::time::Duration;

use fedledger_config::FedConfig;

use crate::coordinator::CoordinatorConfig;

impl From<&FedConfig> for CoordinatorConfig {
    fn from(config: &FedConfig) -> Self {
        let c = &config.coordinator;
        Self {
            group_size: c.group_size,
            max_iterations: c.max_iterations,
            attribution: config.features.attribution,
            rotate_key: config.features.rotate_key,
            one_time_fee: c.one_time_fee,
            settlement_share: c.settlement_share,
            incentive_pool: c.incentive_pool,
            ledger_timeout: Duration::from_millis(config.ledger.timeout_ms),
        }
    }
}
