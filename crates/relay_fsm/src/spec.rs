//! Declarative transition tables.
//!
//! A [`StateMachineSpec`] is plain data: a named, ordered list of states,
//! each mapping event names to a [`Transition`]. Tables can be written in
//! code through [`SpecBuilder`] or loaded from JSON in the compact form
//!
//! ```json
//! {
//!   "name": "inbound",
//!   "initialState": "initial",
//!   "states": [
//!     { "name": "initial",
//!       "events": { "init": { "nextState": "waiting to ping",
//!                             "actions": [["setTimer", 5000], "sendIdentity"] } } },
//!     { "name": "waiting to ping" }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::FsmError;

/// Synthetic event delivered when an armed timer expires.
pub const TIMER_EXPIRED: &str = "timer expired";

/// Built-in action that arms the engine's one-shot timer.
pub const SET_TIMER: &str = "setTimer";

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// An argument passed to a parameterized action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionArg {
    Number(u64),
    Text(String),
}

impl ActionArg {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

impl From<u64> for ActionArg {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for ActionArg {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A single step executed when a transition fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum Action {
    /// `"sendIdentity"`
    Named(String),
    /// `["setTimer", 5000]`
    Parameterized { name: String, args: Vec<ActionArg> },
}

impl Action {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn call(name: impl Into<String>, args: impl IntoIterator<Item = ActionArg>) -> Self {
        Self::Parameterized {
            name: name.into(),
            args: args.into_iter().collect(),
        }
    }

    /// `["setTimer", ms]`
    pub fn set_timer(ms: u64) -> Self {
        Self::call(SET_TIMER, [ActionArg::Number(ms)])
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) | Self::Parameterized { name, .. } => name,
        }
    }

    pub fn args(&self) -> &[ActionArg] {
        match self {
            Self::Named(_) => &[],
            Self::Parameterized { args, .. } => args,
        }
    }
}

/// Wire shape of an action: a bare name or `[name, args...]`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawAction {
    Name(String),
    Call(Vec<ActionArg>),
}

impl TryFrom<RawAction> for Action {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        match raw {
            RawAction::Name(name) => Ok(Self::Named(name)),
            RawAction::Call(mut parts) => {
                if parts.is_empty() {
                    return Err("empty action list".to_string());
                }
                match parts.remove(0) {
                    ActionArg::Text(name) => Ok(Self::Parameterized { name, args: parts }),
                    ActionArg::Number(n) => Err(format!("action name must be a string, got {n}")),
                }
            }
        }
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Named(name) => Self::Name(name),
            Action::Parameterized { name, args } => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(ActionArg::Text(name));
                parts.extend(args);
                Self::Call(parts)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// States and transitions
// ---------------------------------------------------------------------------

/// Where an event leads and what runs on the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub next_state: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// A named state and its outgoing transitions keyed by event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default)]
    pub events: BTreeMap<String, Transition>,
}

impl State {
    /// A state with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.events.is_empty()
    }
}

/// An immutable, validated transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineSpec {
    pub name: String,
    /// Defaults to the first declared state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    pub states: Vec<State>,
}

impl StateMachineSpec {
    pub fn builder(name: impl Into<String>) -> SpecBuilder {
        SpecBuilder::new(name)
    }

    /// Parse and validate a JSON table.
    pub fn from_json(json: &str) -> Result<Self, FsmError> {
        let spec: Self = serde_json::from_str(json).map_err(|e| FsmError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The state a fresh engine starts in.
    pub fn initial_state(&self) -> Option<&str> {
        self.initial_state
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.name.as_str()))
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn transition(&self, state: &str, event: &str) -> Option<&Transition> {
        self.state(state).and_then(|s| s.events.get(event))
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.state(state).is_some_and(State::is_terminal)
    }

    /// Every event name handled by at least one state.
    pub fn event_names(&self) -> BTreeSet<&str> {
        self.states
            .iter()
            .flat_map(|s| s.events.keys().map(String::as_str))
            .collect()
    }

    /// Every action name referenced by some transition, `setTimer` included.
    pub fn action_names(&self) -> BTreeSet<&str> {
        self.states
            .iter()
            .flat_map(|s| s.events.values())
            .flat_map(|t| t.actions.iter().map(Action::name))
            .collect()
    }

    /// Check structural invariants: at least one state, unique state names,
    /// a declared initial state, declared transition targets and well-formed
    /// timers.
    pub fn validate(&self) -> Result<(), FsmError> {
        if self.states.is_empty() {
            return Err(FsmError::EmptySpec(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(FsmError::DuplicateState {
                    machine: self.name.clone(),
                    state: state.name.clone(),
                });
            }
        }

        if let Some(initial) = &self.initial_state {
            if !seen.contains(initial.as_str()) {
                return Err(FsmError::UnknownInitialState {
                    machine: self.name.clone(),
                    state: initial.clone(),
                });
            }
        }

        for state in &self.states {
            for (event, transition) in &state.events {
                if !seen.contains(transition.next_state.as_str()) {
                    return Err(FsmError::UnknownNextState {
                        machine: self.name.clone(),
                        state: state.name.clone(),
                        event: event.clone(),
                        next_state: transition.next_state.clone(),
                    });
                }
                let bad_timer = transition.actions.iter().any(|a| {
                    a.name() == SET_TIMER && a.args().first().and_then(ActionArg::as_u64).is_none()
                });
                if bad_timer {
                    return Err(FsmError::InvalidTimer {
                        machine: self.name.clone(),
                        state: state.name.clone(),
                        event: event.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent construction of a [`StateMachineSpec`].
///
/// [`on`](SpecBuilder::on) adds a transition to the most recently declared
/// state.
#[derive(Debug)]
pub struct SpecBuilder {
    name: String,
    initial_state: Option<String>,
    states: Vec<State>,
    error: Option<FsmError>,
}

impl SpecBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_state: None,
            states: Vec::new(),
            error: None,
        }
    }

    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    pub fn state(mut self, name: impl Into<String>) -> Self {
        self.states.push(State {
            name: name.into(),
            events: BTreeMap::new(),
        });
        self
    }

    pub fn on(
        mut self,
        event: impl Into<String>,
        next_state: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        let event = event.into();
        match self.states.last_mut() {
            Some(state) => {
                state.events.insert(
                    event,
                    Transition {
                        next_state: next_state.into(),
                        actions: actions.into_iter().collect(),
                    },
                );
            }
            None => {
                self.error.get_or_insert(FsmError::OrphanTransition(event));
            }
        }
        self
    }

    pub fn build(self) -> Result<StateMachineSpec, FsmError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let spec = StateMachineSpec {
            name: self.name,
            initial_state: self.initial_state,
            states: self.states,
        };
        spec.validate()?;
        Ok(spec)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
