//! State machine error types.

/// Errors raised while building a [`StateMachineSpec`](crate::StateMachineSpec)
/// or binding an [`Engine`](crate::Engine) to one.
///
/// Every variant is a configuration problem: none of them can occur while
/// events are being dispatched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsmError {
    /// The spec declares no states at all.
    #[error("State machine '{0}' declares no states")]
    EmptySpec(String),

    /// Two states share the same name.
    #[error("State machine '{machine}' declares state '{state}' twice")]
    DuplicateState { machine: String, state: String },

    /// A transition points at a state that was never declared.
    #[error("State machine '{machine}': '{state}' --{event}--> unknown state '{next_state}'")]
    UnknownNextState {
        machine: String,
        state: String,
        event: String,
        next_state: String,
    },

    /// The declared initial state does not exist.
    #[error("State machine '{machine}' starts in unknown state '{state}'")]
    UnknownInitialState { machine: String, state: String },

    /// The spec references an action that has no implementation bound.
    #[error("State machine '{machine}' references unbound action '{action}'")]
    UnboundAction { machine: String, action: String },

    /// A `setTimer` action without a numeric millisecond argument.
    #[error("State machine '{machine}': setTimer in '{state}' on '{event}' needs a duration in ms")]
    InvalidTimer {
        machine: String,
        state: String,
        event: String,
    },

    /// A builder transition was added before any state.
    #[error("Transition on '{0}' added before any state was declared")]
    OrphanTransition(String),

    /// The JSON table could not be parsed.
    #[error("Invalid state machine table: {0}")]
    Parse(String),
}
