#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use treelog::storage::EnvironmentFile;
use treelog::{Environment, EnvironmentConfig, RecoveryConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "treelog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let recovery_config = match RecoveryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let environment_config = EnvironmentConfig::from_env();

    tracing::info!(
        "Loaded configuration: path={}, checkpoint_scan_limit={}, allow_partial_recovery={}, checkpoint_after_recovery={}",
        environment_config.path.display(),
        recovery_config.checkpoint_scan_limit,
        recovery_config.allow_partial_recovery,
        recovery_config.checkpoint_after_recovery
    );

    let file = match EnvironmentFile::open_or_create(&environment_config.path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("Failed to open environment file: {e}");
            std::process::exit(1);
        }
    };

    let environment = match Environment::open(file, &recovery_config) {
        Ok(environment) => environment,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let outcome = environment.recovery();
    if !outcome.warnings.is_empty() {
        tracing::warn!(
            "Recovered with {} warning(s), logged above",
            outcome.warnings.len()
        );
    }
    tracing::info!(
        "Environment ready: root={:?}, recovered_through={}, records_redone={}, records_undone={}",
        environment.root(),
        outcome.recovered_through,
        outcome.stats.records_redone,
        outcome.stats.records_undone
    );

    environment.close();
}
