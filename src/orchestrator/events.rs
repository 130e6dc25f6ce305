use serde::Serialize;
use uuid::Uuid;

use crate::orchestrator::run::{Phase, RunStatus};
use crate::types::{TaskSummary, Verdict};

/// Progress notifications broadcast while a task runs.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        run_id: Uuid,
        instructions: String,
    },
    Phase {
        phase: Phase,
    },
    /// The provider failed transiently and the query is being retried.
    Retrying {
        attempt: u32,
        message: String,
    },
    Proposed {
        number: usize,
        thought: String,
        action: String,
    },
    Decided {
        number: usize,
        verdict: Verdict,
    },
    Executed {
        number: usize,
        action: String,
        url: String,
    },
    StepError {
        number: usize,
        message: String,
    },
    Finished {
        status: RunStatus,
        summary: TaskSummary,
        failure: Option<String>,
    },
}

impl AgentEvent {
    /// Wire name of the event, matching its `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Started { .. } => "started",
            AgentEvent::Phase { .. } => "phase",
            AgentEvent::Retrying { .. } => "retrying",
            AgentEvent::Proposed { .. } => "proposed",
            AgentEvent::Decided { .. } => "decided",
            AgentEvent::Executed { .. } => "executed",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Finished { .. } => "finished",
        }
    }
}
