use std::fmt;

use serde::{Deserialize, Serialize};

use triad_core::types::AgentOutcome;

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// Lifecycle state of one supervised agent process.
///
/// Transitions only move forward; once a terminal state is reached no
/// further transitions are possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentState {
    Pending,
    Starting,
    Running,
    Terminating,
    Terminal { outcome: AgentOutcome },
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Terminal { .. })
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Pending => write!(f, "pending"),
            AgentState::Starting => write!(f, "starting"),
            AgentState::Running => write!(f, "running"),
            AgentState::Terminating => write!(f, "terminating"),
            AgentState::Terminal { outcome } => write!(f, "terminal({outcome})"),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentLifecycleEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycleEvent {
    /// Launch was requested; the process is being spawned.
    Launch,
    /// The process launched successfully and is streaming output.
    Started,
    /// A timeout or cancel asked the process to shut down.
    Terminate,
    /// The agent reached its terminal classification.
    Finished(AgentOutcome),
}

impl fmt::Display for AgentLifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentLifecycleEvent::Launch => write!(f, "launch"),
            AgentLifecycleEvent::Started => write!(f, "started"),
            AgentLifecycleEvent::Terminate => write!(f, "terminate"),
            AgentLifecycleEvent::Finished(outcome) => write!(f, "finished({outcome})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// An invalid (backwards or skipping) transition was attempted.
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: AgentState,
        event: AgentLifecycleEvent,
    },
}

// ---------------------------------------------------------------------------
// AgentStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    current: AgentState,
    history: Vec<(AgentState, AgentLifecycleEvent, AgentState)>,
}

impl AgentStateMachine {
    /// Create a new state machine starting in `Pending`.
    pub fn new() -> Self {
        Self {
            current: AgentState::Pending,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.current
    }

    pub fn history(&self) -> &[(AgentState, AgentLifecycleEvent, AgentState)] {
        &self.history
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Pending     + Launch       -> Starting
    /// - Starting    + Started      -> Running
    /// - Starting    + Finished(o)  -> Terminal(o)   (launch failure / early cancel)
    /// - Running     + Terminate    -> Terminating
    /// - Running     + Finished(o)  -> Terminal(o)
    /// - Terminating + Finished(o)  -> Terminal(o)
    pub fn apply(&mut self, event: AgentLifecycleEvent) -> Result<AgentState, StateMachineError> {
        use AgentLifecycleEvent as E;
        use AgentState as S;

        let next = match (self.current, event) {
            (S::Pending, E::Launch) => S::Starting,
            (S::Starting, E::Started) => S::Running,
            (S::Starting, E::Finished(outcome)) => S::Terminal { outcome },
            (S::Running, E::Terminate) => S::Terminating,
            (S::Running, E::Finished(outcome)) => S::Terminal { outcome },
            (S::Terminating, E::Finished(outcome)) => S::Terminal { outcome },
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "agent state transition");
        Ok(next)
    }

    /// Returns `true` if the given event is valid in the current state.
    pub fn can_apply(&self, event: AgentLifecycleEvent) -> bool {
        use AgentLifecycleEvent as E;
        use AgentState as S;
        matches!(
            (self.current, event),
            (S::Pending, E::Launch)
                | (S::Starting, E::Started)
                | (S::Starting, E::Finished(_))
                | (S::Running, E::Terminate)
                | (S::Running, E::Finished(_))
                | (S::Terminating, E::Finished(_))
        )
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
