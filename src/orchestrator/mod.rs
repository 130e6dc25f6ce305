//! The task state machine: observe, ask, wait for the operator, act.

mod events;
mod run;

pub use events::AgentEvent;
pub use run::{Phase, RunStatus, TaskRun};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::brain::{Completion, CompletionRequest, ProviderError, ReasoningService};
use crate::config::Policy;
use crate::dom::{Snapshot, build_snapshot};
use crate::error::{RunError, RunResult};
use crate::executor::{ExecutionError, Executor};
use crate::operator::{Decision, DecisionSource, InterimLog, Interrupt};
use crate::protocol::{
    Action, ParsedResponse, STOP_SEQUENCE, format_prompt, has_action_tag, parse_response,
    system_prompt,
};
use crate::reconcile::Reconciler;
use crate::remote::{RemoteControl, RemoteError};
use crate::session_log;
use crate::types::{Actor, HistoryEntry, ObservationMetadata, Verdict};

/// How a run left `running`.
enum Ending {
    Finished { answer: String },
    Interrupted(Interrupt),
    Failed(RunError),
}

/// Result of one observe/ask/act cycle.
enum Cycle {
    Continue,
    End(Ending),
}

/// What the operator made of a proposed step.
enum WindowOutcome {
    Execute,
    Skip,
    Interrupted(Interrupt),
}

pub struct Orchestrator {
    policy: Policy,
    remote: Arc<dyn RemoteControl>,
    service: Arc<dyn ReasoningService>,
    decisions: Arc<dyn DecisionSource>,
    interim: Arc<dyn InterimLog>,
    executor: Executor,
    reconciler: Reconciler,
    events: broadcast::Sender<AgentEvent>,
    log_dir: Option<PathBuf>,
    run: TaskRun,
}

impl Orchestrator {
    pub fn new(
        policy: Policy,
        remote: Arc<dyn RemoteControl>,
        service: Arc<dyn ReasoningService>,
        decisions: Arc<dyn DecisionSource>,
        interim: Arc<dyn InterimLog>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            executor: Executor::new(remote.clone(), &policy),
            reconciler: Reconciler::new(service.clone(), &policy),
            policy,
            remote,
            service,
            decisions,
            interim,
            events,
            log_dir: None,
            run: TaskRun::default(),
        }
    }

    /// Broadcast progress on `events` instead of a private channel.
    pub fn with_events(mut self, events: broadcast::Sender<AgentEvent>) -> Self {
        self.events = events;
        self
    }

    /// Write a session log into `dir` whenever a run ends.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// The current or most recent run.
    pub fn task(&self) -> &TaskRun {
        &self.run
    }

    /// Drive one task to a terminal status.
    pub async fn run(&mut self, instructions: &str) -> RunStatus {
        self.run.start(instructions);
        info!(target: "agent", run_id = %self.run.run_id(), %instructions, "task started");
        self.emit(AgentEvent::Started {
            run_id: self.run.run_id(),
            instructions: instructions.to_string(),
        });

        let ending = self.drive().await;
        self.conclude(ending).await;
        self.run.status()
    }

    async fn drive(&mut self) -> Ending {
        self.set_phase(Phase::Attaching);
        if let Err(err) = self.attach().await {
            return Ending::Failed(err);
        }
        self.run.log_event("attached");

        let mut fails_used = 0;
        loop {
            match self.cycle(&mut fails_used).await {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::End(ending)) => return ending,
                Err(err) => return Ending::Failed(err),
            }
        }
    }

    async fn cycle(&mut self, fails_used: &mut u32) -> RunResult<Cycle> {
        if let Some(ending) = self.interrupted() {
            return Ok(Cycle::End(ending));
        }
        if self.run.history().len() >= self.policy.max_steps {
            return Err(RunError::StepCeilingExceeded {
                limit: self.policy.max_steps,
            });
        }

        // Human actions since the last step belong to it and must be in the
        // trace before the next query.
        self.absorb_interim();
        self.reconcile_pending().await;

        self.set_phase(Phase::PullingObservation);
        let snapshot = self.pull_snapshot().await?;
        let snapshot_text = snapshot.text();
        self.run.log_event("snapshot fetched");
        if let Some(ending) = self.interrupted() {
            return Ok(Cycle::End(ending));
        }

        self.set_phase(Phase::Querying);
        let prompt = format_prompt(self.run.instructions(), self.run.history(), &snapshot_text);
        let started = Instant::now();
        self.run.log_event("query started");
        let queried = self.query(&prompt).await;
        self.run.add_agent_time(started.elapsed());
        self.run.log_event("query completed");
        let (completion, parsed) = queried?;
        // A result that lands after an interrupt is dropped.
        if let Some(ending) = self.interrupted() {
            return Ok(Cycle::End(ending));
        }

        self.set_phase(Phase::ShowingResponse);
        let action = parsed.action.clone();
        let terminal = action.is_finish() || action == Action::Fail;

        if action == Action::Fail {
            if *fails_used < self.policy.fail_retries {
                *fails_used += 1;
                warn!(target: "agent", attempt = *fails_used, "agent replied with fail, asking again");
                self.run.log_event("agent replied with fail");
                return Ok(Cycle::Continue);
            }
        } else {
            *fails_used = 0;
        }

        let url = self.remote.current_url().await.unwrap_or_default();
        self.run.visit(&url);
        let entry = HistoryEntry {
            prompt,
            response: completion.text,
            parsed,
            usage: completion.usage,
            verdict: if terminal {
                Verdict::Accepted
            } else {
                Verdict::Pending
            },
            requires_confirmation: false,
            executions: 0,
            metadata: ObservationMetadata {
                snapshot: snapshot_text.clone(),
                action_kind: action.name().to_string(),
                element_id: action.element_id().unwrap_or(-1),
                url,
                ..ObservationMetadata::default()
            },
            user_steps: Vec::new(),
            reconciled: None,
        };
        let thought = entry.parsed.thought.clone();
        let action_text = entry.parsed.action_text.clone();
        let idx = self.run.push_entry(entry);
        info!(target: "agent", step = idx + 1, action = %action_text, "proposed");
        self.emit(AgentEvent::Proposed {
            number: idx + 1,
            thought,
            action: action_text,
        });

        match &action {
            Action::Fail => {
                self.run.log_event("agent gave up");
                return Err(RunError::AgentGaveUp {
                    attempts: *fails_used + 1,
                });
            }
            Action::Finish => {
                return Ok(Cycle::End(Ending::Finished {
                    answer: String::new(),
                }));
            }
            Action::FinishWithAnswer { answer } => {
                return Ok(Cycle::End(Ending::Finished {
                    answer: answer.clone(),
                }));
            }
            _ => {}
        }

        if let Err(err) = self.executor.preview(&action).await {
            debug!(target: "hands", error = %err, "preview failed");
        }

        self.set_phase(Phase::Waiting);
        match self.await_decision(idx).await {
            WindowOutcome::Execute => {}
            WindowOutcome::Skip => return Ok(Cycle::Continue),
            WindowOutcome::Interrupted(interrupt) => {
                return Ok(Cycle::End(Ending::Interrupted(interrupt)));
            }
        }

        self.set_phase(Phase::PerformingAction);
        self.perform(idx, &action, &snapshot_text).await?;

        if self.run.history().len() >= self.policy.max_steps {
            return Err(RunError::StepCeilingExceeded {
                limit: self.policy.max_steps,
            });
        }
        Ok(Cycle::Continue)
    }

    /// The override window for step `idx`, timed as human or agent work.
    async fn await_decision(&mut self, idx: usize) -> WindowOutcome {
        let opened = Instant::now();
        let (outcome, operator_held) = self.override_window(idx).await;
        if operator_held {
            self.run.add_human_time(opened.elapsed());
        } else {
            self.run.add_agent_time(opened.elapsed());
        }
        outcome
    }

    /// One decision is consumed per tick. Silence for the whole window
    /// accepts the step, unless it was rejected or flagged for confirmation,
    /// in which case it is skipped. While a rejected step keeps receiving
    /// human actions the window stays open.
    ///
    /// The flag is true when the operator held or overrode the step.
    async fn override_window(&mut self, idx: usize) -> (WindowOutcome, bool) {
        let mut ticker = tokio::time::interval(self.policy.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_ticks = 0;
        let mut held = false;

        loop {
            ticker.tick().await;
            if let Some(interrupt) = self.decisions.take_interrupt() {
                return (WindowOutcome::Interrupted(interrupt), true);
            }

            let (verdict, flagged) = {
                let entry = &self.run.history()[idx];
                (entry.verdict, entry.requires_confirmation)
            };
            if verdict == Verdict::Rejected && self.absorb_interim() > 0 {
                idle_ticks = 0;
            }

            match self.decisions.poll() {
                Decision::Idle => {
                    idle_ticks += 1;
                    if idle_ticks < self.policy.window_ticks {
                        continue;
                    }
                    if verdict == Verdict::Rejected || flagged {
                        info!(target: "agent", step = idx + 1, "no decision on held step, skipping");
                        self.skip(idx, verdict);
                        return (WindowOutcome::Skip, true);
                    }
                    info!(target: "agent", step = idx + 1, "override window elapsed, accepting");
                    self.decide(idx, Verdict::Accepted, "suggestion accepted");
                    return (WindowOutcome::Execute, held);
                }
                Decision::Accept => {
                    self.decide(idx, Verdict::Accepted, "suggestion accepted");
                    return (WindowOutcome::Execute, held);
                }
                Decision::Reject => {
                    self.decide(idx, Verdict::Rejected, "suggestion rejected");
                    held = true;
                    idle_ticks = 0;
                }
                Decision::Next => {
                    self.skip(idx, verdict);
                    return (WindowOutcome::Skip, true);
                }
                Decision::AskForConfirmation => {
                    info!(target: "agent", step = idx + 1, "confirmation requested");
                    self.run.flag_confirmation(idx);
                    self.run.log_event("confirmation requested");
                    idle_ticks = 0;
                }
            }
        }
    }

    fn decide(&mut self, idx: usize, verdict: Verdict, event: &str) {
        self.run.set_verdict(idx, verdict);
        self.run.log_event(event);
        self.emit(AgentEvent::Decided {
            number: idx + 1,
            verdict,
        });
    }

    /// A rejected step stays rejected; anything else becomes skipped.
    fn skip(&mut self, idx: usize, current: Verdict) {
        let verdict = if current == Verdict::Rejected {
            Verdict::Rejected
        } else {
            Verdict::Skipped
        };
        self.decide(idx, verdict, "step skipped");
    }

    /// Execute step `idx` once. Failures are recorded on the step and the
    /// run goes on; a dropped channel is re-attached first.
    async fn perform(&mut self, idx: usize, action: &Action, snapshot: &str) -> RunResult<()> {
        if self.run.history()[idx].executions > 0 {
            return Ok(());
        }

        let started = Instant::now();
        self.run.log_event("execution started");
        let result = self.executor.execute(action, snapshot).await;
        self.run.add_agent_time(started.elapsed());

        match result {
            Ok(metadata) => {
                self.run.visit(&metadata.url);
                self.run.log_event("execution completed");
                self.emit(AgentEvent::Executed {
                    number: idx + 1,
                    action: action.name().to_string(),
                    url: metadata.url.clone(),
                });
                self.run.record_execution(idx, Some(metadata));
            }
            Err(err) => {
                warn!(target: "agent", step = idx + 1, error = %err, "action failed");
                self.run.log_event(format!("execution failed: {err}"));
                self.run.record_execution(idx, None);
                self.emit(AgentEvent::StepError {
                    number: idx + 1,
                    message: err.to_string(),
                });
                if let ExecutionError::Remote(remote) = &err {
                    if remote.is_detached() {
                        self.attach().await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn attach(&mut self) -> RunResult<()> {
        let attempts = self.policy.reattach_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.remote.attach().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(target: "hands", attempt, error = %err, "attach failed");
                    last = Some(err);
                }
            }
        }
        let err = last.unwrap_or(RemoteError::NotAttached);
        Err(RunError::ResourceAttach(err))
    }

    async fn pull_snapshot(&mut self) -> RunResult<Snapshot> {
        let attempts = self.policy.snapshot_attempts;
        for attempt in 1..=attempts {
            match self.remote.capture_tree().await {
                Ok(raw) => {
                    let snapshot = build_snapshot(&raw, self.policy.viewport_only);
                    if !snapshot.is_empty() {
                        return Ok(snapshot);
                    }
                    debug!(target: "dom", attempt, nodes = raw.len(), "snapshot not ready");
                }
                Err(err) if err.is_detached() => {
                    warn!(target: "hands", "channel dropped, re-attaching");
                    self.attach().await?;
                    self.run.log_event("re-attached");
                }
                Err(err) => {
                    warn!(target: "hands", attempt, error = %err, "capture failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.policy.snapshot_retry_ms)).await;
        }
        Err(RunError::ObservationNotReady { attempts })
    }

    /// Ask for the next action.
    ///
    /// Transient provider errors and replies without an action tag each use
    /// up one attempt. When every reply lacked the tag the last one is parsed
    /// anyway so the parse error reaches the operator.
    async fn query(&mut self, prompt: &str) -> RunResult<(Completion, ParsedResponse)> {
        let request = CompletionRequest {
            system: system_prompt(),
            prompt: prompt.to_string(),
            stop: Some(STOP_SEQUENCE.to_string()),
        };
        debug!(target: "brain", %prompt, "querying");

        let attempts = self.policy.provider_attempts.max(1);
        let mut untagged: Option<Completion> = None;
        let mut transient: Option<ProviderError> = None;

        for attempt in 1..=attempts {
            match self.service.complete(&request).await {
                Ok(mut completion) => {
                    if !completion.text.ends_with(STOP_SEQUENCE) {
                        completion.text.push_str(STOP_SEQUENCE);
                    }
                    if has_action_tag(&completion.text) {
                        let parsed = parse_response(&completion.text)?;
                        return Ok((completion, parsed));
                    }
                    warn!(target: "brain", attempt, "reply has no action tag");
                    untagged = Some(completion);
                }
                Err(err) if err.is_transient() => {
                    warn!(target: "brain", attempt, error = %err, "reasoning service call failed");
                    self.emit(AgentEvent::Retrying {
                        attempt,
                        message: err.to_string(),
                    });
                    transient = Some(err);
                }
                Err(err) => return Err(RunError::from_provider(err, attempt)),
            }
        }

        match (untagged, transient) {
            (Some(completion), _) => Err(parse_response(&completion.text)
                .err()
                .map(RunError::from)
                .unwrap_or(RunError::ProviderFatal("reply has no action".to_string()))),
            (None, Some(err)) => Err(RunError::from_provider(err, attempts)),
            (None, None) => Err(RunError::ProviderFatal("no reply".to_string())),
        }
    }

    /// Move the interim log onto the latest step. Returns how many actions
    /// were attached; actions outside a rejected step are dropped.
    fn absorb_interim(&mut self) -> usize {
        let steps = self.interim.drain();
        if steps.is_empty() {
            return 0;
        }
        let count = steps.len();
        if self.run.append_user_steps(steps) {
            debug!(target: "agent", count, "recorded human actions");
            count
        } else {
            debug!(target: "agent", count, "dropping human actions outside a rejected step");
            0
        }
    }

    async fn reconcile_pending(&mut self) {
        let Some(idx) = self.run.unreconciled() else {
            return;
        };
        let trace = self
            .reconciler
            .reconcile(&self.run.history()[idx].user_steps)
            .await;
        debug!(target: "reconcile", step = idx + 1, %trace, "reconciled");
        self.run.set_reconciled(idx, trace);
    }

    fn interrupted(&self) -> Option<Ending> {
        self.decisions.take_interrupt().map(Ending::Interrupted)
    }

    async fn conclude(&mut self, ending: Ending) {
        self.absorb_interim();
        self.reconcile_pending().await;

        let (status, summary, failure) = match ending {
            Ending::Finished { answer } => {
                info!(target: "agent", %answer, "task complete");
                (
                    RunStatus::Success,
                    self.run.summarize(&answer, 1.0, Actor::Agent),
                    None,
                )
            }
            Ending::Interrupted(interrupt) => {
                info!(target: "agent", ?interrupt, "task interrupted");
                (
                    RunStatus::Interrupted,
                    self.run.summarize("", interrupt.success(), Actor::Human),
                    None,
                )
            }
            Ending::Failed(err) => {
                error!(target: "agent", error = %err, "task failed");
                self.run.log_event(format!("error: {err}"));
                (
                    RunStatus::Error,
                    self.run.summarize("", 0.0, Actor::Agent),
                    Some(err.to_string()),
                )
            }
        };
        self.run.finish(status, summary.clone(), failure.clone());

        if let Err(err) = self.remote.detach().await {
            warn!(target: "hands", error = %err, "detach failed");
        }
        if let Some(dir) = &self.log_dir {
            match session_log::write(dir, &self.run, self.service.model()) {
                Ok(path) => info!(target: "agent", path = %path.display(), "session log written"),
                Err(err) => warn!(target: "agent", error = %err, "could not write session log"),
            }
        }

        self.emit(AgentEvent::Finished {
            status,
            summary,
            failure,
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(target: "agent", ?phase, "phase");
        self.run.set_phase(phase);
        self.emit(AgentEvent::Phase { phase });
    }

    fn emit(&self, event: AgentEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}
