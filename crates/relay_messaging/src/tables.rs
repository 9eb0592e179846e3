//! Transition tables for the two connection roles.
//!
//! The inbound machine runs on server-accepted sockets: it announces the
//! local identity, then pings every five seconds and gives up on a peer
//! that stays silent for a second. The outbound machine runs on dialled
//! sockets and additionally reconnects after a one-second backoff until a
//! `"close connection"` command drains it to `closed`.

use std::sync::Arc;

use once_cell::sync::Lazy;
use relay_fsm::{Action, ActionArg, FsmError, StateMachineSpec, TIMER_EXPIRED};

// Engine events.
pub const INIT: &str = "init";
pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";
pub const ERROR: &str = "error";
pub const PONG: &str = "pong";
pub const UNEXPECTED_RESPONSE: &str = "unexpected-response";
pub const CLOSE_CONNECTION: &str = "close connection";

// Actions bound by every connection.
pub const SEND_IDENTITY: &str = "sendIdentity";
pub const SEND_PING: &str = "sendPing";
pub const CLOSE_WEB_SOCKET: &str = "closeWebSocket";
pub const CREATE_WEB_SOCKET: &str = "createWebSocket";
pub const EMIT: &str = "emit";

/// Terminal state of both machines.
pub const CLOSED: &str = "closed";

const PING_INTERVAL_MS: u64 = 5000;
const PONG_TIMEOUT_MS: u64 = 1000;
const REOPEN_DELAY_MS: u64 = 1000;

static INBOUND: Lazy<Result<Arc<StateMachineSpec>, FsmError>> =
    Lazy::new(|| build_inbound().map(Arc::new));

static OUTBOUND: Lazy<Result<Arc<StateMachineSpec>, FsmError>> =
    Lazy::new(|| build_outbound().map(Arc::new));

/// The machine driving server-accepted connections.
pub fn inbound() -> Result<Arc<StateMachineSpec>, FsmError> {
    INBOUND.clone()
}

/// The machine driving dialled connections.
pub fn outbound() -> Result<Arc<StateMachineSpec>, FsmError> {
    OUTBOUND.clone()
}

fn timer(ms: u64) -> Action {
    Action::set_timer(ms)
}

fn act(name: &str) -> Action {
    Action::named(name)
}

fn emit(tag: &str) -> Action {
    Action::call(EMIT, [ActionArg::from(tag)])
}

fn build_inbound() -> Result<StateMachineSpec, FsmError> {
    StateMachineSpec::builder("inbound")
        .state("initial")
        .on(INIT, "waiting to ping", [timer(PING_INTERVAL_MS), act(SEND_IDENTITY)])
        .state("waiting to ping")
        .on(TIMER_EXPIRED, "waiting for pong", [timer(PONG_TIMEOUT_MS), act(SEND_PING)])
        .on(CLOSE, CLOSED, [emit("close")])
        .on(ERROR, "closing", [act(CLOSE_WEB_SOCKET)])
        .state("waiting for pong")
        .on(PONG, "waiting to ping", [timer(PING_INTERVAL_MS)])
        .on(TIMER_EXPIRED, "closing", [act(CLOSE_WEB_SOCKET)])
        .on(CLOSE, CLOSED, [emit("close")])
        .on(ERROR, "closing", [act(CLOSE_WEB_SOCKET)])
        .state("closing")
        .on(CLOSE, CLOSED, [emit("close")])
        .state(CLOSED)
        .build()
}

fn build_outbound() -> Result<StateMachineSpec, FsmError> {
    StateMachineSpec::builder("outbound")
        .state("no webSocket")
        .on(INIT, "connecting", [act(CREATE_WEB_SOCKET)])
        .on(CLOSE_CONNECTION, CLOSED, [emit("closed")])
        .state("connecting")
        .on(CLOSE, "waiting to re-open", [timer(REOPEN_DELAY_MS)])
        .on(ERROR, "closing", [])
        .on(OPEN, "waiting to ping", [timer(REOPEN_DELAY_MS), act(SEND_IDENTITY)])
        .on(CLOSE_CONNECTION, "waiting for open to close", [])
        .state("waiting for open to close")
        .on(OPEN, "waiting to close", [act(CLOSE_WEB_SOCKET)])
        .on(CLOSE, CLOSED, [emit("closed")])
        .on(ERROR, CLOSED, [emit("closed")])
        .state("waiting to re-open")
        .on(TIMER_EXPIRED, "connecting", [act(CREATE_WEB_SOCKET)])
        .on(CLOSE_CONNECTION, "waiting to close", [act(CLOSE_WEB_SOCKET)])
        .state("closing")
        .on(CLOSE, "waiting to re-open", [timer(REOPEN_DELAY_MS)])
        .on(CLOSE_CONNECTION, "waiting to close", [])
        .state("waiting for pong")
        .on(PONG, "waiting to ping", [timer(PING_INTERVAL_MS)])
        .on(TIMER_EXPIRED, "closing", [act(CLOSE_WEB_SOCKET)])
        .on(CLOSE, "waiting to re-open", [timer(REOPEN_DELAY_MS)])
        .on(CLOSE_CONNECTION, "waiting to close", [act(CLOSE_WEB_SOCKET)])
        .state("waiting to ping")
        .on(TIMER_EXPIRED, "waiting for pong", [timer(PONG_TIMEOUT_MS), act(SEND_PING)])
        .on(CLOSE, "waiting to re-open", [timer(REOPEN_DELAY_MS)])
        .on(CLOSE_CONNECTION, "waiting to close", [act(CLOSE_WEB_SOCKET)])
        .state("waiting to close")
        .on(CLOSE, CLOSED, [emit("closed")])
        .on(ERROR, CLOSED, [emit("closed")])
        .state(CLOSED)
        .build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
