//! The human side of a run: override decisions, interrupts and the log of
//! actions performed while the agent was paused.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::UserLogEntry;

/// The operator's signal during an override window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Idle,
    Accept,
    Reject,
    Next,
    AskForConfirmation,
}

/// A request to stop the run from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interrupt {
    Abort,
    MarkSuccess,
    MarkFailure,
}

impl Interrupt {
    /// End-to-end success credited to the run.
    pub fn success(&self) -> f64 {
        match self {
            Interrupt::MarkSuccess => 1.0,
            Interrupt::Abort | Interrupt::MarkFailure => 0.0,
        }
    }
}

pub trait DecisionSource: Send + Sync {
    /// Take the pending decision, leaving `Idle` behind.
    fn poll(&self) -> Decision;

    fn take_interrupt(&self) -> Option<Interrupt>;
}

pub trait InterimLog: Send + Sync {
    /// Everything recorded since the last drain, oldest first.
    fn drain(&self) -> Vec<UserLogEntry>;
}

#[derive(Default)]
struct ConsoleState {
    decision: Decision,
    interrupt: Option<Interrupt>,
    user_log: VecDeque<UserLogEntry>,
}

/// Mailbox between the control server and the orchestrator.
///
/// Setters overwrite: only the latest decision and interrupt are kept.
#[derive(Default)]
pub struct OperatorConsole {
    state: Mutex<ConsoleState>,
}

impl OperatorConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&self, decision: Decision) {
        self.lock().decision = decision;
    }

    pub fn interrupt(&self, interrupt: Interrupt) {
        self.lock().interrupt = Some(interrupt);
    }

    pub fn record(&self, entry: UserLogEntry) {
        self.lock().user_log.push_back(entry);
    }

    /// Forget everything left over from a previous run.
    pub fn reset(&self) {
        *self.lock() = ConsoleState::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        // A poisoned console still holds valid plain data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DecisionSource for OperatorConsole {
    fn poll(&self) -> Decision {
        std::mem::take(&mut self.lock().decision)
    }

    fn take_interrupt(&self) -> Option<Interrupt> {
        self.lock().interrupt.take()
    }
}

impl InterimLog for OperatorConsole {
    fn drain(&self) -> Vec<UserLogEntry> {
        self.lock().user_log.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_consumes_the_decision() {
        let console = OperatorConsole::new();
        console.decide(Decision::Reject);
        assert_eq!(console.poll(), Decision::Reject);
        assert_eq!(console.poll(), Decision::Idle);
    }

    #[test]
    fn latest_decision_wins() {
        let console = OperatorConsole::new();
        console.decide(Decision::Reject);
        console.decide(Decision::Accept);
        assert_eq!(console.poll(), Decision::Accept);
    }

    #[test]
    fn drain_is_fifo_and_empties_the_log() {
        let console = OperatorConsole::new();
        console.record(UserLogEntry::new("click"));
        console.record(UserLogEntry::new("scroll"));
        let drained: Vec<_> = console
            .drain()
            .into_iter()
            .map(|entry| entry.action_type)
            .collect();
        assert_eq!(drained, vec!["click", "scroll"]);
        assert!(console.drain().is_empty());
    }

    #[test]
    fn decisions_and_interrupts_are_independent() {
        let console = OperatorConsole::new();
        console.interrupt(Interrupt::MarkSuccess);
        console.decide(Decision::Next);
        assert_eq!(console.take_interrupt(), Some(Interrupt::MarkSuccess));
        assert_eq!(console.take_interrupt(), None);
        assert_eq!(console.poll(), Decision::Next);
    }

    #[test]
    fn decision_wire_names() {
        let decision: Decision = serde_json::from_str("\"askforconfirmation\"").unwrap();
        assert_eq!(decision, Decision::AskForConfirmation);
        let interrupt: Interrupt = serde_json::from_str("\"mark_failure\"").unwrap();
        assert_eq!(interrupt.success(), 0.0);
    }
}
