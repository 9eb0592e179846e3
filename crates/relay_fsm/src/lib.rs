//! Relay FSM: declarative finite-state machines with pluggable actions.
//!
//! A [`StateMachineSpec`] is an immutable transition table; an [`Engine`]
//! runs one instance of it against a caller-owned context, dispatching
//! named actions from an [`ActionTable`] and keeping the bookkeeping for a
//! single one-shot timer per instance.
//!
//! ```rust
//! use std::sync::Arc;
//! use relay_fsm::{Action, ActionArg, ActionTable, Engine, StateMachineSpec};
//!
//! let spec = StateMachineSpec::builder("switch")
//!     .state("off")
//!     .on("flip", "on", [Action::named("announce")])
//!     .state("on")
//!     .build()
//!     .unwrap();
//!
//! let table = ActionTable::new()
//!     .bind("announce", |count: &mut u32, _: &[ActionArg]| *count += 1);
//!
//! let mut engine = Engine::new(Arc::new(spec), table).unwrap();
//! let mut count = 0;
//! engine.handle_event(&mut count, "flip");
//! assert_eq!(engine.current_state(), "on");
//! assert_eq!(count, 1);
//! ```

pub mod engine;
pub mod error;
pub mod spec;

pub use engine::{ActionFn, ActionTable, ArmedTimer, Engine, Fired};
pub use error::FsmError;
pub use spec::{
    Action, ActionArg, SET_TIMER, SpecBuilder, State, StateMachineSpec, TIMER_EXPIRED, Transition,
};
