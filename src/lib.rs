//! A browser agent that works alongside a human operator.
//!
//! Each step the agent reads a compact accessibility snapshot of the page,
//! asks a reasoning service for the next action and gives the operator a
//! short window to accept, reject or take over before acting.

pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod logging;
pub mod operator;
pub mod orchestrator;
pub mod protocol;
pub mod reconcile;
pub mod remote;
pub mod session_log;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{RunError, RunResult};
pub use orchestrator::{AgentEvent, Orchestrator, Phase, RunStatus, TaskRun};
