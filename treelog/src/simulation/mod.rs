//! Deterministic crash and fault simulation for recovery tests.
//!
//! [`SimulatedStorage`] keeps node pages, the superblock and the log in
//! memory. Writes stay staged until synced, [`SimulatedStorage::crash`]
//! drops whatever was not made durable, and a [`FaultConfig`] injects
//! errors at the storage boundary. All randomness comes from one seeded
//! RNG, so a failing seed replays exactly.

mod storage;

pub use storage::{FaultConfig, SimulatedStorage, SimulatedStorageStats};
