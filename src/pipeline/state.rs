//! Graph run state management

use crate::error::{Error, Result};

/// Run state of a stage graph.
///
/// Transitions always move one step at a time: `Stopped <-> Paused <-> Running`.
/// A request to jump from `Stopped` to `Running` is walked through `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    /// Nothing is allocated, no data flows
    #[default]
    Stopped,

    /// Resources are allocated, data flow is held at an item boundary
    Paused,

    /// Data is flowing
    Running,
}

impl RunState {
    /// Check if a single-step transition is valid
    pub fn can_transition_to(&self, target: &RunState) -> bool {
        use RunState::*;

        match (self, target) {
            (Stopped, Paused) => true,
            (Paused, Running) => true,
            (Running, Paused) => true,
            (Paused, Stopped) => true,

            // Self-transitions
            (a, b) if a == b => true,

            // Stopped <-> Running must go through Paused
            _ => false,
        }
    }

    /// The ordered sequence of single steps that leads from `self` to `target`.
    /// Empty when already there.
    pub fn path_to(self, target: RunState) -> Vec<RunState> {
        let mut path = Vec::new();
        let mut current = self;
        while current != target {
            current = current.step_towards(target);
            path.push(current);
        }
        path
    }

    fn step_towards(self, target: RunState) -> RunState {
        use RunState::*;

        match (self, target) {
            (Stopped, _) => Paused,
            (Running, _) => Paused,
            (Paused, t) => t,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            RunState::Stopped => "Stopped",
            RunState::Paused => "Paused",
            RunState::Running => "Running",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, RunState::Paused)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, RunState::Stopped)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Outcome of a `StageGraph::set_state` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// Whether every step of the request completed
    pub ok: bool,

    /// State the graph is in now
    pub state: RunState,

    /// Step that was requested but never acknowledged
    pub pending: Option<RunState>,
}

impl StateChange {
    /// Accept the change only when it fully reached `target` with nothing
    /// outstanding.
    pub fn verify(self, target: RunState) -> Result<RunState> {
        if self.ok && self.pending.is_none() && self.state == target {
            Ok(self.state)
        } else {
            Err(Error::StateTransition {
                target,
                reached: self.state,
                pending: self.pending,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use RunState::*;

        assert!(Stopped.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Running));
        assert!(Running.can_transition_to(&Paused));
        assert!(Paused.can_transition_to(&Stopped));

        // Self-transitions
        assert!(Running.can_transition_to(&Running));
    }

    #[test]
    fn test_invalid_transitions() {
        use RunState::*;

        assert!(!Stopped.can_transition_to(&Running));
        assert!(!Running.can_transition_to(&Stopped));
    }

    #[test]
    fn test_path_walks_through_paused() {
        use RunState::*;

        assert_eq!(Stopped.path_to(Running), vec![Paused, Running]);
        assert_eq!(Running.path_to(Stopped), vec![Paused, Stopped]);
        assert_eq!(Running.path_to(Paused), vec![Paused]);
        assert!(Paused.path_to(Paused).is_empty());
    }

    #[test]
    fn test_verify_rejects_pending() {
        let change = StateChange {
            ok: false,
            state: RunState::Running,
            pending: Some(RunState::Paused),
        };
        match change.verify(RunState::Paused) {
            Err(Error::StateTransition {
                target,
                reached,
                pending,
            }) => {
                assert_eq!(target, RunState::Paused);
                assert_eq!(reached, RunState::Running);
                assert_eq!(pending, Some(RunState::Paused));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let done = StateChange {
            ok: true,
            state: RunState::Paused,
            pending: None,
        };
        assert_eq!(done.verify(RunState::Paused).unwrap(), RunState::Paused);
    }
}
