//! Environment lifecycle.
//!
//! An environment is usable only after recovery succeeded. The
//! [`EnvironmentGuard`] holds the lifecycle state and is shared by every
//! component that works on the environment. Once recovery fails the guard
//! stays in `RecoveryFailed` until it is closed, and every guarded call
//! fails fast with the original failure.
//!
//! ```text
//! Closed --begin_open--> Opening --mark_open--> Open
//!                           |
//!                           +--mark_failed--> RecoveryFailed
//! any --close--> Closed
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::storage::btree::NodeId;
use crate::storage::io::Storage;
use crate::storage::recovery::{
    FatalRecoveryError, RecoveryController, RecoveryErrorKind, RecoveryOutcome, RecoveryPhase,
};

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentState {
    Opening,
    Open,
    RecoveryFailed,
    Closed,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::RecoveryFailed => "recovery failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors returned by guarded operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    /// Recovery failed; the environment must be closed and reopened.
    RecoveryFailed(FatalRecoveryError),
    /// The environment was closed.
    Closed,
    /// Recovery has not finished yet.
    NotOpen,
    /// The requested lifecycle change is not allowed from the current state.
    InvalidTransition {
        from: EnvironmentState,
        to: EnvironmentState,
    },
}

impl std::fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecoveryFailed(e) => {
                write!(f, "environment must be reopened: {e}")
            }
            Self::Closed => write!(f, "environment is closed"),
            Self::NotOpen => write!(f, "environment is not open yet"),
            Self::InvalidTransition { from, to } => {
                write!(f, "cannot move environment from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for EnvironmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RecoveryFailed(e) => Some(e),
            Self::Closed | Self::NotOpen | Self::InvalidTransition { .. } => None,
        }
    }
}

#[derive(Debug)]
struct GuardState {
    state: EnvironmentState,
    failure: Option<FatalRecoveryError>,
}

/// Shared lifecycle flag of one environment.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct EnvironmentGuard {
    inner: Arc<Mutex<GuardState>>,
}

impl Default for EnvironmentGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentGuard {
    /// A guard for an environment that has not been opened.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(EnvironmentState::Closed)
    }

    /// A guard for an environment whose recovery is about to start.
    #[must_use]
    pub fn opening() -> Self {
        Self::with_state(EnvironmentState::Opening)
    }

    fn with_state(state: EnvironmentState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GuardState {
                state,
                failure: None,
            })),
        }
    }

    // A panic while holding the lock cannot leave the state half-written.
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> EnvironmentState {
        self.lock().state
    }

    /// The failure that moved the guard to `RecoveryFailed`.
    #[must_use]
    pub fn failure(&self) -> Option<FatalRecoveryError> {
        self.lock().failure.clone()
    }

    /// Start opening. Only allowed from `Closed`.
    pub fn begin_open(&self) -> Result<(), EnvironmentError> {
        self.transition(EnvironmentState::Closed, EnvironmentState::Opening)
    }

    /// Recovery succeeded. Only allowed from `Opening`.
    pub fn mark_open(&self) -> Result<(), EnvironmentError> {
        self.transition(EnvironmentState::Opening, EnvironmentState::Open)
    }

    /// Recovery failed. Only allowed from `Opening`; the state is terminal
    /// until [`close`](Self::close).
    pub fn mark_failed(&self, failure: &FatalRecoveryError) -> Result<(), EnvironmentError> {
        let mut guard = self.lock();
        if guard.state != EnvironmentState::Opening {
            return Err(EnvironmentError::InvalidTransition {
                from: guard.state,
                to: EnvironmentState::RecoveryFailed,
            });
        }
        guard.state = EnvironmentState::RecoveryFailed;
        guard.failure = Some(failure.clone());
        drop(guard);

        warn!(kind = %failure.kind, "Environment marked unusable");
        Ok(())
    }

    /// Close from any state, clearing a recorded failure.
    ///
    /// Returns the state the guard was in.
    pub fn close(&self) -> EnvironmentState {
        let mut guard = self.lock();
        let previous = guard.state;
        guard.state = EnvironmentState::Closed;
        guard.failure = None;
        previous
    }

    /// Fail unless the environment is open.
    pub fn check(&self) -> Result<(), EnvironmentError> {
        let guard = self.lock();
        match guard.state {
            EnvironmentState::Open => Ok(()),
            EnvironmentState::Opening => Err(EnvironmentError::NotOpen),
            EnvironmentState::Closed => Err(EnvironmentError::Closed),
            EnvironmentState::RecoveryFailed => match &guard.failure {
                Some(failure) => Err(EnvironmentError::RecoveryFailed(failure.clone())),
                None => Err(EnvironmentError::NotOpen),
            },
        }
    }

    fn transition(
        &self,
        from: EnvironmentState,
        to: EnvironmentState,
    ) -> Result<(), EnvironmentError> {
        let mut guard = self.lock();
        if guard.state != from {
            return Err(EnvironmentError::InvalidTransition {
                from: guard.state,
                to,
            });
        }
        guard.state = to;
        Ok(())
    }
}

/// A recovered, usable environment.
#[derive(Debug)]
pub struct Environment<S: Storage> {
    storage: S,
    guard: EnvironmentGuard,
    recovery: RecoveryOutcome,
}

impl<S: Storage> Environment<S> {
    /// Open an environment, running recovery first.
    pub fn open(storage: S, config: &RecoveryConfig) -> Result<Self, FatalRecoveryError> {
        Self::recover(storage, config, EnvironmentGuard::opening()).map_err(|e| match e {
            EnvironmentError::RecoveryFailed(failure) => failure,
            other => FatalRecoveryError::new(
                RecoveryErrorKind::Storage,
                RecoveryPhase::Finalize,
                None,
                other.to_string(),
            ),
        })
    }

    /// Open an environment whose lifecycle is tracked by a shared `guard`.
    ///
    /// The guard must be `Closed`. When recovery fails the guard is left in
    /// `RecoveryFailed`. If another holder moves the guard while recovery
    /// runs, the open fails with `InvalidTransition`.
    pub fn open_with_guard(
        storage: S,
        config: &RecoveryConfig,
        guard: EnvironmentGuard,
    ) -> Result<Self, EnvironmentError> {
        guard.begin_open()?;
        Self::recover(storage, config, guard)
    }

    fn recover(
        mut storage: S,
        config: &RecoveryConfig,
        guard: EnvironmentGuard,
    ) -> Result<Self, EnvironmentError> {
        let recovery = RecoveryController::new(&mut storage, *config, guard.clone())
            .run()
            .map_err(EnvironmentError::RecoveryFailed)?;
        if let Err(e) = guard.mark_open() {
            warn!(error = %e, "Guard changed state during recovery");
            return Err(e);
        }

        info!(
            root = ?recovery.root,
            recovered_through = recovery.recovered_through,
            "Environment open"
        );
        Ok(Self {
            storage,
            guard,
            recovery,
        })
    }

    /// Root node of the recovered tree.
    #[must_use]
    pub const fn root(&self) -> Option<NodeId> {
        self.recovery.root
    }

    /// What recovery did while opening.
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryOutcome {
        &self.recovery
    }

    #[must_use]
    pub const fn guard(&self) -> &EnvironmentGuard {
        &self.guard
    }

    /// Storage behind the environment, while it is open.
    pub fn storage(&mut self) -> Result<&mut S, EnvironmentError> {
        self.guard.check()?;
        Ok(&mut self.storage)
    }

    /// Close the environment and hand the storage back.
    pub fn close(self) -> S {
        self.guard.close();
        info!("Environment closed");
        self.storage
    }
}
