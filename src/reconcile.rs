//! Turns the raw log of human actions into a short action trace.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::brain::{CompletionRequest, ProviderError, ReasoningService, complete_with_retries};
use crate::config::Policy;
use crate::types::{InterimStep, KeyData, ScrollData, UserLogEntry};

/// The trace of a step with no human actions.
pub const EMPTY_TRACE: &str = "[]";

const ACTION_FORMAT: &str = r#"Available actions:
- click(elementId: number): clicks on an element
- hover(elementId: number): hovers the mouse over an element
- setvalue(elementId: number, value: string): focuses on and sets the value of an input element
- scroll(direction: string): scrolls the page 'up', 'down', 'left' or 'right'
- goto(url: string): navigates to a URL"#;

const MERGE_RULES: &str = r#"Rules:
1. Merge consecutive events whenever possible. Several keyup or input events in the same field become one setvalue. For consecutive input into one textbox keep only the final value: setvalue(1, 'Hello') followed by setvalue(1, 'Hello world') becomes setvalue(1, 'Hello world').
2. Discard repeated events of the same type in the same place, especially scroll and mouseover. Two consecutive scrolls in the same direction merge into one. A random, disjoint scroll is noise and can be ignored.
3. Only reply with actions in name(args) form. Do not write any code.
4. Mouseover events are often noise. Keep one only if it is meaningful for the surrounding actions; a mouseover while typing into a text field is not.
5. Reply with a JSON array: [{"thought": short summary of the action, "action": the action}]."#;

fn merge_system_prompt() -> String {
    format!(
        "You will be shown event listener log data captured while a user operated a web page, one JSON object per event. \
Each has an action_type (click/scroll/keyup/input/mouseover/contextmenu) and, when known, the node id and name of the element acted on, \
its outer HTML, the pointer coordinates, the page URL, scroll deltas and key data.\n\n\
Clean up the raw events into a list of actions.\n\n{ACTION_FORMAT}\n\n{MERGE_RULES}"
    )
}

fn concat_system_prompt() -> String {
    format!(
        "You will be shown a list of actions a user performed on a web page, already grouped in batches. \
Clean it up into one list of actions.\n\n{ACTION_FORMAT}\n\n{MERGE_RULES}\n\
6. In each thought, mention the implication of the action. Instead of saying the user clicked on the start time, \
say the user clicked on the start time and set it to 9 pm."
    )
}

#[derive(Error, Debug)]
enum ReconcileError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("no action list in reply")]
    NoArray,
}

/// The fields of a log entry the model sees. Snapshots stay out of the payload.
#[derive(Serialize)]
struct EventPayload<'a> {
    action_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    element_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    element_outer_html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    coordinate_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    coordinate_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    click_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scroll_data: Option<&'a ScrollData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_data: Option<&'a KeyData>,
}

impl<'a> From<&'a UserLogEntry> for EventPayload<'a> {
    fn from(entry: &'a UserLogEntry) -> Self {
        Self {
            action_type: &entry.action_type,
            node_id: entry.node_id.as_deref(),
            element_name: entry.element_name.as_deref(),
            element_outer_html: entry.element_outer_html.as_deref(),
            coordinate_x: entry.coordinate_x,
            coordinate_y: entry.coordinate_y,
            click_type: entry.click_type.as_deref(),
            url: entry.url.as_deref(),
            scroll_data: entry.scroll_data.as_ref(),
            key_data: entry.key_data.as_ref(),
        }
    }
}

pub struct Reconciler {
    service: Arc<dyn ReasoningService>,
    chunk_size: usize,
    attempts: u32,
}

impl Reconciler {
    pub fn new(service: Arc<dyn ReasoningService>, policy: &Policy) -> Self {
        Self {
            service,
            chunk_size: policy.reconcile_chunk_size.max(1),
            attempts: policy.provider_attempts,
        }
    }

    /// Reconcile `entries` into a JSON array of `{thought, action}` objects.
    ///
    /// Never fails: when the service is unusable a local trace is derived
    /// from the log itself.
    pub async fn reconcile(&self, entries: &[UserLogEntry]) -> String {
        if entries.is_empty() {
            return EMPTY_TRACE.to_string();
        }
        match self.reconcile_remote(entries).await {
            Ok(trace) => trace,
            Err(err) => {
                warn!(target: "reconcile", error = %err, "falling back to local trace");
                fallback_trace(entries)
            }
        }
    }

    async fn reconcile_remote(&self, entries: &[UserLogEntry]) -> Result<String, ReconcileError> {
        let mut merged: Vec<Value> = Vec::new();
        for chunk in entries.chunks(self.chunk_size) {
            let events: Vec<String> = chunk
                .iter()
                .map(|entry| serde_json::to_string(&EventPayload::from(entry)).unwrap_or_default())
                .collect();
            let reply = self.ask(merge_system_prompt(), events.join("\n")).await?;
            let actions = array_span(&reply)
                .and_then(|span| serde_json::from_str::<Vec<Value>>(span).ok())
                .unwrap_or_default();
            debug!(target: "reconcile", count = actions.len(), "merged chunk");
            merged.extend(actions);
        }

        let batches = serde_json::to_string(&merged).unwrap_or_else(|_| EMPTY_TRACE.to_string());
        let reply = self.ask(concat_system_prompt(), batches).await?;
        let span = array_span(&reply).ok_or(ReconcileError::NoArray)?;
        serde_json::from_str::<Vec<InterimStep>>(span).map_err(|_| ReconcileError::NoArray)?;
        Ok(span.to_string())
    }

    async fn ask(&self, system: String, prompt: String) -> Result<String, ProviderError> {
        let request = CompletionRequest {
            system,
            prompt,
            stop: None,
        };
        let completion =
            complete_with_retries(self.service.as_ref(), &request, self.attempts, |_, _| {}).await?;
        Ok(completion.text)
    }
}

/// The text from the first `[` to the last `]`, if there is one.
fn array_span(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Derive a trace without the model: clicks, the final value typed into each
/// field, and scroll direction changes.
fn fallback_trace(entries: &[UserLogEntry]) -> String {
    let mut steps: Vec<InterimStep> = Vec::new();
    let mut last_field: Option<i64> = None;

    for entry in entries {
        let element_id = entry.node_id.as_deref().and_then(|id| id.trim().parse::<i64>().ok());
        let label = entry
            .element_name
            .clone()
            .or_else(|| element_id.map(|id| format!("element {id}")))
            .unwrap_or_else(|| "the page".to_string());

        match entry.action_type.as_str() {
            "click" => {
                let Some(id) = element_id else { continue };
                last_field = None;
                steps.push(InterimStep {
                    thought: format!("The user clicked on {label}."),
                    action: format!("click({id})"),
                });
            }
            "input" | "keyup" => {
                let (Some(id), Some(key_data)) = (element_id, entry.key_data.as_ref()) else {
                    continue;
                };
                let value = serde_json::to_string(&key_data.full_text_entry)
                    .unwrap_or_else(|_| "\"\"".to_string());
                let step = InterimStep {
                    thought: format!("The user typed {value} into {label}."),
                    action: format!("setvalue({id}, {value})"),
                };
                match steps.last_mut() {
                    Some(previous) if last_field == Some(id) => *previous = step,
                    _ => steps.push(step),
                }
                last_field = Some(id);
            }
            "scroll" => {
                let Some(data) = entry.scroll_data.as_ref() else { continue };
                if data.delta_y == 0.0 {
                    continue;
                }
                let direction = if data.delta_y > 0.0 { "down" } else { "up" };
                let action = format!("scroll('{direction}')");
                last_field = None;
                if steps.last().is_some_and(|step| step.action == action) {
                    continue;
                }
                steps.push(InterimStep {
                    thought: format!("The user scrolled {direction}."),
                    action,
                });
            }
            _ => {}
        }
    }

    serde_json::to_string(&steps).unwrap_or_else(|_| EMPTY_TRACE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedService;

    fn click(node_id: &str, name: &str) -> UserLogEntry {
        let mut entry = UserLogEntry::new("click");
        entry.node_id = Some(node_id.to_string());
        entry.element_name = Some(name.to_string());
        entry
    }

    fn typed(node_id: &str, text: &str) -> UserLogEntry {
        let mut entry = UserLogEntry::new("keyup");
        entry.node_id = Some(node_id.to_string());
        entry.key_data = Some(KeyData {
            key: text.chars().last().map(String::from).unwrap_or_default(),
            full_text_entry: text.to_string(),
            ..KeyData::default()
        });
        entry
    }

    fn scroll(delta_y: f64) -> UserLogEntry {
        let mut entry = UserLogEntry::new("scroll");
        entry.scroll_data = Some(ScrollData {
            delta_x: 0.0,
            delta_y,
            delta_mode: 0,
        });
        entry
    }

    fn reconciler(service: Arc<ScriptedService>) -> Reconciler {
        Reconciler::new(service, &Policy::default())
    }

    #[tokio::test]
    async fn no_entries_skip_the_service() {
        let service = Arc::new(ScriptedService::replying(&["unused"]));
        let trace = reconciler(service.clone()).reconcile(&[]).await;
        assert_eq!(trace, "[]");
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn entries_are_chunked_then_summarised() {
        let chunk = r#"Here you go: [{"thought": "t", "action": "click(5)"}]"#;
        let last = r#"[{"thought": "The user opened the cart", "action": "click(5)"}] done"#;
        let service = Arc::new(ScriptedService::replying(&[chunk, chunk, last]));
        let entries: Vec<_> = (0..5).map(|i| click(&i.to_string(), "Cart")).collect();

        let trace = reconciler(service.clone()).reconcile(&entries).await;

        assert_eq!(trace, r#"[{"thought": "The user opened the cart", "action": "click(5)"}]"#);
        let requests = service.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].prompt.lines().count(), 4);
        assert_eq!(requests[1].prompt.lines().count(), 1);
        assert!(requests[2].system.contains("implication"));
        assert!(requests[2].prompt.starts_with("[{"));
    }

    #[tokio::test]
    async fn payload_leaves_out_snapshots() {
        let service = Arc::new(ScriptedService::replying(&["[]", "[]"]));
        let mut entry = click("5", "Cart");
        entry.snapshot = "[5] button \"Cart\"".to_string();
        reconciler(service.clone()).reconcile(&[entry]).await;
        let prompt = &service.requests()[0].prompt;
        assert!(prompt.contains("\"node_id\":\"5\""));
        assert!(!prompt.contains("snapshot"));
    }

    #[tokio::test]
    async fn service_failure_falls_back_to_local_trace() {
        let service = Arc::new(ScriptedService::new(vec![Err(ProviderError::Fatal(
            "no key".into(),
        ))]));
        let entries = vec![
            click("12", "Search"),
            typed("12", "fa"),
            typed("12", "fax"),
            scroll(120.0),
            scroll(80.0),
            UserLogEntry::new("mouseover"),
        ];

        let trace = reconciler(service).reconcile(&entries).await;
        let steps: Vec<InterimStep> = serde_json::from_str(&trace).unwrap();
        let actions: Vec<_> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["click(12)", "setvalue(12, \"fax\")", "scroll('down')"]);
    }

    #[tokio::test]
    async fn reply_without_array_falls_back() {
        let service = Arc::new(ScriptedService::replying(&["nothing useful"]));
        let trace = reconciler(service).reconcile(&[click("3", "Buy")]).await;
        let steps: Vec<InterimStep> = serde_json::from_str(&trace).unwrap();
        assert_eq!(steps[0].action, "click(3)");
    }

    #[test]
    fn array_span_needs_both_brackets_in_order() {
        assert_eq!(array_span("x [1, [2]] y"), Some("[1, [2]]"));
        assert_eq!(array_span("] before ["), None);
        assert_eq!(array_span("none"), None);
    }
}
