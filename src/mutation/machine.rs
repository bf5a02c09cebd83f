// ============================================================================
// Mutation State Machine
// ============================================================================
//
// Every mutation binding moves through:
//
//   Idle --begin--> Pending --confirm--> Confirmed
//                      |
//                      +--roll_back--> RolledBack
//
// Terminal states accept `begin` again (passing through Idle), so a binding
// is reusable. A second `begin` while Pending is rejected.
//
// ============================================================================

use crate::core::{CacheError, Result};
use crate::observable::{ObservableCell, Reactor, Subscription};
use std::fmt;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationPhase {
    /// No operation in flight
    #[default]
    Idle,

    /// Optimistic change applied, waiting for the server
    Pending,

    /// Server accepted the change
    Confirmed,

    /// Server rejected the change and the optimistic state was undone
    RolledBack,
}

impl MutationPhase {
    pub fn is_pending(&self) -> bool {
        matches!(self, MutationPhase::Pending)
    }

    /// Check if the phase ends an operation
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationPhase::Confirmed | MutationPhase::RolledBack)
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationPhase::Idle => write!(f, "idle"),
            MutationPhase::Pending => write!(f, "pending"),
            MutationPhase::Confirmed => write!(f, "confirmed"),
            MutationPhase::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Reactive phase + error pair with checked transitions.
pub struct MutationMachine {
    phase: ObservableCell<MutationPhase>,
    error: ObservableCell<Option<CacheError>>,
    transition: Mutex<()>,
    reactor: Reactor,
}

impl fmt::Debug for MutationMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationMachine")
            .field("phase", &self.phase.get())
            .field("error", &self.error.get())
            .finish()
    }
}

impl MutationMachine {
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            phase: ObservableCell::new(reactor, MutationPhase::Idle),
            error: ObservableCell::new(reactor, None),
            transition: Mutex::new(()),
            reactor: reactor.clone(),
        }
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase.get()
    }

    /// Error of the last rolled back operation.
    pub fn error(&self) -> Option<CacheError> {
        self.error.get()
    }

    pub fn subscribe_phase(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.phase.subscribe(callback)
    }

    pub fn subscribe_error(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.error.subscribe(callback)
    }

    /// Fails with `MutationInFlight` while an operation is pending.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.phase.get().is_pending() {
            return Err(CacheError::MutationInFlight);
        }
        Ok(())
    }

    /// Idle (or terminal) -> Pending.
    pub fn begin(&self) -> Result<()> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_ready()?;
        let _batch = self.reactor.begin_batch();
        self.error.set(None);
        self.phase.set(MutationPhase::Idle);
        self.phase.set(MutationPhase::Pending);
        Ok(())
    }

    /// Pending -> Confirmed.
    pub fn confirm(&self) -> Result<()> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.expect_pending("confirm")?;
        self.phase.set(MutationPhase::Confirmed);
        Ok(())
    }

    /// Pending -> RolledBack, recording `error`.
    pub fn roll_back(&self, error: CacheError) -> Result<()> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.expect_pending("roll back")?;
        let _batch = self.reactor.begin_batch();
        self.error.set(Some(error));
        self.phase.set(MutationPhase::RolledBack);
        Ok(())
    }

    /// Terminal -> Idle. Rejected while pending.
    pub fn reset(&self) -> Result<()> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_ready()?;
        let _batch = self.reactor.begin_batch();
        self.error.set(None);
        self.phase.set(MutationPhase::Idle);
        Ok(())
    }

    fn expect_pending(&self, action: &str) -> Result<()> {
        let phase = self.phase.get();
        if phase.is_pending() {
            Ok(())
        } else {
            Err(CacheError::InvalidTransition(format!(
                "cannot {} a mutation in phase '{}'",
                action, phase
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let machine = MutationMachine::new(&Reactor::new());
        assert_eq!(machine.phase(), MutationPhase::Idle);

        machine.begin().unwrap();
        assert_eq!(machine.phase(), MutationPhase::Pending);
        machine.confirm().unwrap();
        assert!(machine.phase().is_terminal());

        // terminal states are reusable
        machine.begin().unwrap();
        assert_eq!(machine.phase(), MutationPhase::Pending);
    }

    #[test]
    fn test_concurrent_begin_rejected() {
        let machine = MutationMachine::new(&Reactor::new());
        machine.begin().unwrap();
        assert_eq!(machine.begin(), Err(CacheError::MutationInFlight));
        assert_eq!(machine.reset(), Err(CacheError::MutationInFlight));
    }

    #[test]
    fn test_roll_back_records_error() {
        let machine = MutationMachine::new(&Reactor::new());
        machine.begin().unwrap();
        let err = CacheError::mutation("todo", "offline");
        machine.roll_back(err.clone()).unwrap();

        assert_eq!(machine.phase(), MutationPhase::RolledBack);
        assert_eq!(machine.error(), Some(err));
        assert_eq!(machine.phase().to_string(), "rolled_back");

        machine.reset().unwrap();
        assert_eq!(machine.phase(), MutationPhase::Idle);
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn test_invalid_transitions() {
        let machine = MutationMachine::new(&Reactor::new());
        assert!(matches!(machine.confirm(), Err(CacheError::InvalidTransition(_))));
        assert!(matches!(
            machine.roll_back(CacheError::MutationInFlight),
            Err(CacheError::InvalidTransition(_))
        ));
    }
}
