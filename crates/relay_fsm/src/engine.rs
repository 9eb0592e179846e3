//! Engine: executes a [`StateMachineSpec`] against a mutable context.
//!
//! The engine is sans-IO: it never sleeps or spawns. Actions run
//! synchronously against a caller-supplied context `C`, and a `setTimer`
//! action only records an [`ArmedTimer`] that the driver collects with
//! [`Engine::take_armed_timer`] and later feeds back through
//! [`Engine::expire_timer`].
//!
//! Unknown `(state, event)` pairs are silent no-ops. Races between timers
//! and transport events rely on this: a late event simply finds no handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::FsmError;
use crate::spec::{Action, ActionArg, SET_TIMER, StateMachineSpec, TIMER_EXPIRED};

/// An action implementation bound by name.
pub type ActionFn<C> = Box<dyn FnMut(&mut C, &[ActionArg]) + Send>;

/// Binding of action names to implementations.
pub struct ActionTable<C> {
    actions: HashMap<String, ActionFn<C>>,
}

impl<C> ActionTable<C> {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Bind `name` to `action`, replacing any earlier binding.
    pub fn bind<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: FnMut(&mut C, &[ActionArg]) + Send + 'static,
    {
        self.actions.insert(name.into(), Box::new(action));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<C> Default for ActionTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A timer request produced by `setTimer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub id: u64,
    pub delay: Duration,
}

/// Record of a transition that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub from: String,
    pub event: String,
    pub to: String,
    pub actions: Vec<Action>,
}

/// One running instance of a state machine.
pub struct Engine<C> {
    spec: Arc<StateMachineSpec>,
    actions: ActionTable<C>,
    current: String,
    next_timer_id: u64,
    pending_timer: Option<u64>,
    armed: Option<ArmedTimer>,
}

impl<C> Engine<C> {
    /// Create an engine in the spec's initial state.
    ///
    /// Fails if the spec is structurally invalid or if any action it
    /// references (other than the built-in `setTimer`) is not bound.
    pub fn new(spec: Arc<StateMachineSpec>, actions: ActionTable<C>) -> Result<Self, FsmError> {
        spec.validate()?;

        if let Some(missing) = spec
            .action_names()
            .into_iter()
            .find(|name| *name != SET_TIMER && !actions.contains(name))
        {
            return Err(FsmError::UnboundAction {
                machine: spec.name.clone(),
                action: missing.to_string(),
            });
        }

        let current = spec
            .initial_state()
            .map(str::to_string)
            .ok_or_else(|| FsmError::EmptySpec(spec.name.clone()))?;

        Ok(Self {
            spec,
            actions,
            current,
            next_timer_id: 0,
            pending_timer: None,
            armed: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &StateMachineSpec {
        &self.spec
    }

    pub fn current_state(&self) -> &str {
        &self.current
    }

    /// True once the machine sits in a state with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.spec.is_terminal(&self.current)
    }

    /// Deliver `event`. Returns the transition that fired, or `None` when the
    /// current state has no handler for it (state and context untouched).
    pub fn handle_event(&mut self, ctx: &mut C, event: &str) -> Option<Fired> {
        let spec = Arc::clone(&self.spec);
        let Some(transition) = spec.transition(&self.current, event) else {
            trace!(
                "[{}] ignoring '{event}' in state '{}'",
                spec.name, self.current
            );
            return None;
        };

        let from = std::mem::replace(&mut self.current, transition.next_state.clone());
        debug!(
            "[{}] '{from}' --{event}--> '{}'",
            spec.name, transition.next_state
        );

        for action in &transition.actions {
            self.run_action(ctx, action);
        }

        Some(Fired {
            from,
            event: event.to_string(),
            to: transition.next_state.clone(),
            actions: transition.actions.clone(),
        })
    }

    /// Deliver the expiry of timer `id`.
    ///
    /// Only the most recently armed timer counts; an older one firing late
    /// is dropped here, exactly like any other unhandled event.
    pub fn expire_timer(&mut self, ctx: &mut C, id: u64) -> Option<Fired> {
        if self.pending_timer != Some(id) {
            trace!("[{}] superseded timer {id} fired", self.spec.name);
            return None;
        }
        self.pending_timer = None;
        self.handle_event(ctx, TIMER_EXPIRED)
    }

    /// Collect the timer armed by the last `handle_event`, if any. The driver
    /// is responsible for sleeping `delay` and calling [`expire_timer`](Self::expire_timer).
    pub fn take_armed_timer(&mut self) -> Option<ArmedTimer> {
        self.armed.take()
    }

    /// Id of the timer whose expiry is currently awaited.
    pub fn pending_timer(&self) -> Option<u64> {
        self.pending_timer
    }

    fn run_action(&mut self, ctx: &mut C, action: &Action) {
        if action.name() == SET_TIMER {
            let ms = action.args().first().and_then(ActionArg::as_u64).unwrap_or(0);
            self.next_timer_id += 1;
            let armed = ArmedTimer {
                id: self.next_timer_id,
                delay: Duration::from_millis(ms),
            };
            self.pending_timer = Some(armed.id);
            self.armed = Some(armed);
            return;
        }

        match self.actions.actions.get_mut(action.name()) {
            Some(f) => f(ctx, action.args()),
            // Unreachable after construction-time validation.
            None => warn!("[{}] no binding for action '{}'", self.spec.name, action.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
