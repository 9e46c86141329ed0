// Life of an open:
// 1. Open the environment file and its log
// 2. Recovery controller:
//     - Locate the last checkpoint
//     - Undo unfinished transactions (backward scan)
//     - Redo committed work (forward scan)
//     - Validate touched nodes bottom-up, level by level
//     - Pick the root, flush, checkpoint
// 3. Guard goes OPEN, or RECOVERY_FAILED until the environment is closed
//
// System components:
//  - Log reader and writer
//  - Level-ordered node map
//  - Undo/redo applier
//  - Recovery controller
//  - Environment state guard

pub mod config;
pub mod environment;
pub mod simulation;
pub mod storage;

#[cfg(test)]
mod e2e_tests;

pub use config::{ConfigError, EnvironmentConfig, RecoveryConfig};
pub use environment::{Environment, EnvironmentError, EnvironmentGuard, EnvironmentState};
