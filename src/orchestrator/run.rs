use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Actor, HistoryEntry, ObservationMetadata, TaskSummary, TimeLogEntry, UserLogEntry, Verdict,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
    Interrupted,
}

/// What a running task is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Idle,
    Attaching,
    PullingObservation,
    Querying,
    ShowingResponse,
    PerformingAction,
    Waiting,
}

/// The state of one task run.
///
/// Only the orchestrator mutates it; everyone else gets a shared reference.
#[derive(Debug, Clone, Default)]
pub struct TaskRun {
    run_id: Uuid,
    instructions: String,
    history: Vec<HistoryEntry>,
    status: RunStatus,
    phase: Phase,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    agent_time: Duration,
    human_time: Duration,
    time_log: Vec<TimeLogEntry>,
    url_trail: Vec<String>,
    summary: Option<TaskSummary>,
    failure: Option<String>,
}

impl TaskRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn agent_ms(&self) -> u64 {
        self.agent_time.as_millis() as u64
    }

    pub fn human_ms(&self) -> u64 {
        self.human_time.as_millis() as u64
    }

    pub fn total_ms(&self) -> u64 {
        self.started
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn time_log(&self) -> &[TimeLogEntry] {
        &self.time_log
    }

    pub fn url_trail(&self) -> &[String] {
        &self.url_trail
    }

    pub fn summary(&self) -> Option<&TaskSummary> {
        self.summary.as_ref()
    }

    /// Why the run ended in `Error`, if it did.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub(crate) fn start(&mut self, instructions: &str) {
        *self = TaskRun {
            run_id: Uuid::new_v4(),
            instructions: instructions.to_string(),
            status: RunStatus::Running,
            phase: Phase::Attaching,
            started: Some(Instant::now()),
            started_at: Some(Utc::now()),
            ..TaskRun::default()
        };
        self.log_event("task started");
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn log_event(&mut self, event: impl Into<String>) {
        let elapsed_ms = self.total_ms();
        self.time_log.push(TimeLogEntry {
            event: event.into(),
            elapsed_ms,
        });
    }

    /// Append `url` to the trail unless it is the last one already.
    pub(crate) fn visit(&mut self, url: &str) {
        if url.is_empty() || self.url_trail.last().is_some_and(|last| last == url) {
            return;
        }
        self.url_trail.push(url.to_string());
    }

    pub(crate) fn add_agent_time(&mut self, elapsed: Duration) {
        self.agent_time += elapsed;
    }

    pub(crate) fn add_human_time(&mut self, elapsed: Duration) {
        self.human_time += elapsed;
    }

    /// Record a new step and return its index.
    pub(crate) fn push_entry(&mut self, entry: HistoryEntry) -> usize {
        self.history.push(entry);
        self.history.len() - 1
    }

    pub(crate) fn set_verdict(&mut self, idx: usize, verdict: Verdict) {
        if let Some(entry) = self.history.get_mut(idx) {
            entry.verdict = verdict;
        }
    }

    pub(crate) fn flag_confirmation(&mut self, idx: usize) {
        if let Some(entry) = self.history.get_mut(idx) {
            entry.requires_confirmation = true;
        }
    }

    /// Attach human actions to the latest step if the operator rejected it.
    /// New actions invalidate any earlier reconciliation. Returns false when
    /// the actions were not attached.
    pub(crate) fn append_user_steps(&mut self, steps: Vec<UserLogEntry>) -> bool {
        if steps.is_empty() {
            return true;
        }
        match self.history.last_mut() {
            Some(entry) if entry.verdict == Verdict::Rejected => {
                entry.user_steps.extend(steps);
                entry.reconciled = None;
                true
            }
            _ => false,
        }
    }

    /// Index of the latest step whose human actions still need reconciling.
    pub(crate) fn unreconciled(&self) -> Option<usize> {
        let idx = self.history.len().checked_sub(1)?;
        let entry = &self.history[idx];
        (!entry.user_steps.is_empty() && entry.reconciled.is_none()).then_some(idx)
    }

    pub(crate) fn set_reconciled(&mut self, idx: usize, trace: String) {
        if let Some(entry) = self.history.get_mut(idx) {
            entry.reconciled = Some(trace);
        }
    }

    /// Count an execution attempt, keeping the observation when there is one.
    pub(crate) fn record_execution(&mut self, idx: usize, metadata: Option<ObservationMetadata>) {
        if let Some(entry) = self.history.get_mut(idx) {
            entry.executions += 1;
            if let Some(metadata) = metadata {
                entry.metadata = metadata;
            }
        }
    }

    pub(crate) fn finish(
        &mut self,
        status: RunStatus,
        summary: TaskSummary,
        failure: Option<String>,
    ) {
        self.status = status;
        self.phase = Phase::Idle;
        self.summary = Some(summary);
        self.failure = failure;
        self.log_event(format!("task finished: {status:?}"));
    }

    /// Metrics over the history as it stands.
    pub fn summarize(&self, answer: &str, success: f64, last_step: Actor) -> TaskSummary {
        let agent_steps = self.history.len();
        let accepted = self
            .history
            .iter()
            .filter(|entry| entry.verdict == Verdict::Accepted)
            .count();
        let human_steps = self
            .history
            .iter()
            .map(|entry| entry.interim_steps().len())
            .sum::<usize>();
        let human_interventions = self
            .history
            .iter()
            .filter(|entry| !entry.user_steps.is_empty())
            .count();
        let step_accuracy = if agent_steps == 0 {
            0.0
        } else {
            accepted as f64 / agent_steps as f64
        };

        TaskSummary {
            answer: answer.to_string(),
            end_to_end_success: success,
            step_accuracy,
            total_steps: agent_steps + human_steps,
            human_steps,
            agent_steps,
            human_interventions,
            last_step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_response;
    use crate::types::Usage;

    fn entry(verdict: Verdict) -> HistoryEntry {
        let response = "<Action>click(5)</Action>";
        HistoryEntry {
            prompt: String::new(),
            response: response.to_string(),
            parsed: parse_response(response).unwrap(),
            usage: Usage::default(),
            verdict,
            requires_confirmation: false,
            executions: 0,
            metadata: ObservationMetadata::default(),
            user_steps: Vec::new(),
            reconciled: None,
        }
    }

    #[test]
    fn start_resets_everything() {
        let mut run = TaskRun::default();
        run.start("first");
        let first_id = run.run_id();
        run.push_entry(entry(Verdict::Accepted));
        run.visit("https://a.example");

        run.start("second");
        assert_ne!(run.run_id(), first_id);
        assert_eq!(run.instructions(), "second");
        assert!(run.history().is_empty());
        assert!(run.url_trail().is_empty());
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(run.time_log()[0].event, "task started");
    }

    #[test]
    fn url_trail_collapses_repeats() {
        let mut run = TaskRun::default();
        for url in ["https://a", "https://a", "", "https://b", "https://a"] {
            run.visit(url);
        }
        assert_eq!(run.url_trail(), ["https://a", "https://b", "https://a"]);
    }

    #[test]
    fn new_user_steps_invalidate_reconciliation() {
        let mut run = TaskRun::default();
        assert!(!run.append_user_steps(vec![UserLogEntry::new("click")]));

        let idx = run.push_entry(entry(Verdict::Rejected));
        assert!(run.append_user_steps(vec![UserLogEntry::new("click")]));
        assert_eq!(run.unreconciled(), Some(idx));
        run.set_reconciled(idx, "[]".into());
        assert_eq!(run.unreconciled(), None);
        run.append_user_steps(vec![UserLogEntry::new("scroll")]);
        assert_eq!(run.unreconciled(), Some(idx));
        assert_eq!(run.history()[idx].user_steps.len(), 2);
    }

    #[test]
    fn user_steps_only_attach_to_a_rejected_step() {
        let mut run = TaskRun::default();
        let idx = run.push_entry(entry(Verdict::Accepted));
        assert!(!run.append_user_steps(vec![UserLogEntry::new("click")]));
        assert!(run.history()[idx].user_steps.is_empty());
        assert_eq!(run.unreconciled(), None);

        run.set_verdict(idx, Verdict::Rejected);
        assert!(run.append_user_steps(vec![UserLogEntry::new("click")]));
        assert_eq!(run.history()[idx].user_steps.len(), 1);
    }

    #[test]
    fn summary_counts_agent_and_human_steps() {
        let mut run = TaskRun::default();
        run.start("task");
        run.push_entry(entry(Verdict::Accepted));
        let rejected = run.push_entry(entry(Verdict::Rejected));
        run.append_user_steps(vec![UserLogEntry::new("click"), UserLogEntry::new("keyup")]);
        run.set_reconciled(
            rejected,
            r#"[{"thought":"a","action":"click(1)"},{"thought":"b","action":"setvalue(2, \"x\")"}]"#
                .into(),
        );
        run.push_entry(entry(Verdict::Skipped));
        run.push_entry(entry(Verdict::Accepted));

        let summary = run.summarize("", 1.0, Actor::Agent);
        assert_eq!(summary.agent_steps, 4);
        assert_eq!(summary.human_steps, 2);
        assert_eq!(summary.total_steps, 6);
        assert_eq!(summary.human_interventions, 1);
        assert_eq!(summary.step_accuracy, 0.5);
    }

    #[test]
    fn empty_history_has_zero_accuracy() {
        let run = TaskRun::default();
        let summary = run.summarize("", 0.0, Actor::Human);
        assert_eq!(summary.step_accuracy, 0.0);
        assert_eq!(summary.total_steps, 0);
    }
}
