//! Pure state machine for the agent router
//!
//! This module implements a pure functional state machine with NO I/O.
//! The run loop feeds it one event per agent turn and executes the returned
//! actions.
//!
//! Key design principles:
//! - Pure function: transition(state, event, max_turns) -> (state, actions)
//! - No async, no I/O
//! - Terminal states ignore further turns (never panic)
//! - Summary capture is an action, so the caller owns `RunState`

/// Router state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Issuing agent turns
    Running { turns: usize },
    /// A usable summary exists; no further turns
    Converged { turns: usize },
    /// Turn cap hit without a summary
    MaxIterReached { turns: usize },
}

impl State {
    /// Starting state of a pass
    pub fn initial() -> Self {
        State::Running { turns: 0 }
    }

    pub fn turns(&self) -> usize {
        match self {
            State::Running { turns }
            | State::Converged { turns }
            | State::MaxIterReached { turns } => *turns,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::Running { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            State::Running { .. } => "RUNNING",
            State::Converged { .. } => "CONVERGED",
            State::MaxIterReached { .. } => "MAX_ITER_REACHED",
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An agent turn finished
    TurnCompleted {
        /// Whether `RunState.summary` already holds usable text
        summary_present: bool,
        /// Text of the turn's last assistant message, if any
        assistant_text: Option<String>,
    },
}

/// Actions to execute as side effects of transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Copy this text into `RunState.summary`
    CaptureSummary { text: String },
    /// Run another agent turn
    IssueTurn,
    /// Log activity
    LogActivity { message: String },
}

/// Pure state transition function
///
/// After every turn: an empty summary is filled from the turn's non-blank
/// assistant text; a usable summary converges; otherwise the turn count is
/// checked against `max_turns`.
pub fn transition(state: State, event: Event, max_turns: usize) -> (State, Vec<Action>) {
    match (state, event) {
        (
            State::Running { turns },
            Event::TurnCompleted {
                summary_present,
                assistant_text,
            },
        ) => {
            let turns = turns + 1;
            let mut actions = Vec::new();

            let captured = match assistant_text {
                Some(text) if !summary_present && !text.trim().is_empty() => {
                    actions.push(Action::CaptureSummary { text });
                    true
                }
                _ => false,
            };

            if summary_present || captured {
                actions.push(Action::LogActivity {
                    message: format!("Converged after {} turn(s)", turns),
                });
                (State::Converged { turns }, actions)
            } else if turns >= max_turns {
                actions.push(Action::LogActivity {
                    message: format!("Reached turn cap ({}) without a summary", max_turns),
                });
                (State::MaxIterReached { turns }, actions)
            } else {
                actions.push(Action::IssueTurn);
                (State::Running { turns }, actions)
            }
        }

        // Terminal states absorb further events
        (terminal, _) => (terminal, Vec::new()),
    }
}
