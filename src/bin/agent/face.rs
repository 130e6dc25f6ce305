use std::convert::Infallible;
use std::sync::Arc;

use anyhow::bail;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webpilot::AgentEvent;
use webpilot::operator::{Decision, Interrupt, OperatorConsole};
use webpilot::types::{TaskSummary, UserLogEntry};
use webpilot::{Phase, RunStatus};

/// Last known state of the agent, served by `GET /status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusView {
    pub run_id: Option<Uuid>,
    pub instructions: Option<String>,
    pub status: RunStatus,
    pub phase: Phase,
    pub step: Option<usize>,
    pub summary: Option<TaskSummary>,
    pub failure: Option<String>,
}

impl StatusView {
    fn apply(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Started {
                run_id,
                instructions,
            } => {
                *self = StatusView {
                    run_id: Some(*run_id),
                    instructions: Some(instructions.clone()),
                    status: RunStatus::Running,
                    ..StatusView::default()
                };
            }
            AgentEvent::Phase { phase } => self.phase = *phase,
            AgentEvent::Proposed { number, .. } => self.step = Some(*number),
            AgentEvent::Finished {
                status,
                summary,
                failure,
            } => {
                self.status = *status;
                self.phase = Phase::Idle;
                self.summary = Some(summary.clone());
                self.failure = failure.clone();
            }
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub task_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub console: Arc<OperatorConsole>,
    pub status: Arc<RwLock<StatusView>>,
}

#[derive(Deserialize)]
struct TaskPayload {
    instructions: String,
}

#[derive(Deserialize)]
struct DecisionPayload {
    decision: Decision,
}

#[derive(Deserialize)]
struct InterruptPayload {
    interrupt: Interrupt,
}

/// Start the control server on the first free port in `port..port + 10`.
/// Returns the queue of submitted tasks.
pub async fn start_server(
    port: u16,
    console: Arc<OperatorConsole>,
    event_tx: broadcast::Sender<AgentEvent>,
) -> anyhow::Result<mpsc::Receiver<String>> {
    let (task_tx, task_rx) = mpsc::channel::<String>(1);
    let status = Arc::new(RwLock::new(StatusView::default()));

    tokio::spawn(track_status(event_tx.subscribe(), status.clone()));

    let state = Arc::new(AppState {
        task_tx,
        event_tx,
        console,
        status,
    });

    let app = Router::new()
        .route("/task", post(task_handler))
        .route("/decision", post(decision_handler))
        .route("/interrupt", post(interrupt_handler))
        .route("/user-log", post(user_log_handler))
        .route("/events", get(sse_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    // Fall back to the next ports if an old agent still holds this one.
    let mut bound = None;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            Ok(listener) => {
                bound = Some((listener, p));
                break;
            }
            Err(err) => debug!(target: "agent", port = p, error = %err, "port busy"),
        }
    }
    let Some((listener, port)) = bound else {
        bail!(
            "could not bind to any port {port}-{}; stop the old agent first",
            port.saturating_add(9)
        );
    };

    info!(target: "agent", "control server listening on http://127.0.0.1:{port}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(target: "agent", error = %err, "control server stopped");
        }
    });

    Ok(task_rx)
}

async fn track_status(
    mut events: broadcast::Receiver<AgentEvent>,
    status: Arc<RwLock<StatusView>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => status.write().await.apply(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(target: "agent", skipped, "status tracker lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn task_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TaskPayload>,
) -> (StatusCode, &'static str) {
    let instructions = payload.instructions.trim().to_string();
    if instructions.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty instructions");
    }

    info!(target: "agent", %instructions, "task submitted");
    match state.task_tx.try_send(instructions) {
        Ok(()) => (StatusCode::ACCEPTED, "queued"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            (StatusCode::CONFLICT, "a task is already queued")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "agent is shutting down")
        }
    }
}

async fn decision_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DecisionPayload>,
) -> &'static str {
    debug!(target: "agent", decision = ?payload.decision, "operator decision");
    state.console.decide(payload.decision);
    "ok"
}

async fn interrupt_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InterruptPayload>,
) -> &'static str {
    info!(target: "agent", interrupt = ?payload.interrupt, "operator interrupt");
    state.console.interrupt(payload.interrupt);
    "ok"
}

async fn user_log_handler(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<UserLogEntry>,
) -> &'static str {
    debug!(target: "agent", action = %entry.action_type, "user action recorded");
    state.console.record(entry);
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusView> {
    Json(state.status.read().await.clone())
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Event::default()
                .event(event.name())
                .json_data(&event)
                .ok()
                .map(Ok::<_, Infallible>),
            Err(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use webpilot::types::Actor;

    #[test]
    fn status_follows_the_event_stream() {
        let mut view = StatusView::default();
        let run_id = Uuid::new_v4();
        view.apply(&AgentEvent::Started {
            run_id,
            instructions: "find price of item X".to_string(),
        });
        view.apply(&AgentEvent::Phase {
            phase: Phase::Querying,
        });
        assert_eq!(view.status, RunStatus::Running);
        assert_eq!(view.phase, Phase::Querying);
        assert_eq!(view.run_id, Some(run_id));

        view.apply(&AgentEvent::Finished {
            status: RunStatus::Success,
            summary: TaskSummary {
                answer: "$279.49".to_string(),
                end_to_end_success: 1.0,
                step_accuracy: 1.0,
                total_steps: 1,
                human_steps: 0,
                agent_steps: 1,
                human_interventions: 0,
                last_step: Actor::Agent,
            },
            failure: None,
        });
        assert_eq!(view.status, RunStatus::Success);
        assert_eq!(view.phase, Phase::Idle);
        assert_eq!(view.summary.unwrap().answer, "$279.49");
    }

    #[test]
    fn payloads_use_lowercase_names() {
        let decision: DecisionPayload = serde_json::from_str(r#"{"decision":"reject"}"#).unwrap();
        assert_eq!(decision.decision, Decision::Reject);
        let interrupt: InterruptPayload =
            serde_json::from_str(r#"{"interrupt":"mark_success"}"#).unwrap();
        assert_eq!(interrupt.interrupt, Interrupt::MarkSuccess);
    }
}
