use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ParsedResponse;

/// A point in page CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Bounding geometry of an element, as reported by the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point {
            x: (self.left + self.right) / 2.0,
            y: (self.top + self.bottom) / 2.0,
        }
    }
}

/// Identity stamped onto an element at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMarker {
    pub element_id: i64,
    pub in_viewport: bool,
}

/// One node of the raw accessibility snapshot.
///
/// Produced fresh on every capture and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub node_id: String,
    pub role: Option<String>,
    pub name: Option<String>,
    pub properties: Vec<(String, String)>,
    pub child_ids: Vec<String>,
    /// `None` for the document root.
    pub parent_id: Option<String>,
    pub backend_id: Option<i64>,
    pub bounds: Option<Rect>,
    pub marker: Option<ElementMarker>,
}

/// Token accounting reported by the reasoning service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The operator's verdict on a proposed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Skipped,
}

/// What the agent observes after executing an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationMetadata {
    pub document: String,
    pub snapshot: String,
    pub screenshot: String,
    pub action_kind: String,
    pub position: Option<Point>,
    pub element_id: i64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollData {
    pub delta_x: f64,
    pub delta_y: f64,
    pub delta_mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyData {
    pub key: String,
    pub code: String,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
    pub full_text_entry: String,
}

/// An operation the human performed while the agent was paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLogEntry {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub action_type: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub element_name: Option<String>,
    #[serde(default)]
    pub element_outer_html: Option<String>,
    #[serde(default)]
    pub coordinate_x: Option<f64>,
    #[serde(default)]
    pub coordinate_y: Option<f64>,
    #[serde(default)]
    pub click_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub scroll_data: Option<ScrollData>,
    #[serde(default)]
    pub key_data: Option<KeyData>,
    /// Snapshot text captured when the entry was recorded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot: String,
}

impl UserLogEntry {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action_type: action_type.into(),
            node_id: None,
            element_name: None,
            element_outer_html: None,
            coordinate_x: None,
            coordinate_y: None,
            click_type: None,
            url: None,
            scroll_data: None,
            key_data: None,
            snapshot: String::new(),
        }
    }
}

/// One reconciled human action, as it appears in prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterimStep {
    pub thought: String,
    pub action: String,
}

/// One completed orchestration step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub response: String,
    pub parsed: ParsedResponse,
    pub usage: Usage,
    pub verdict: Verdict,
    pub requires_confirmation: bool,
    pub executions: u32,
    pub metadata: ObservationMetadata,
    pub user_steps: Vec<UserLogEntry>,
    /// JSON array of [`InterimStep`] once the user steps are reconciled.
    pub reconciled: Option<String>,
}

impl HistoryEntry {
    /// Reconciled human actions, or nothing if the trace is missing or malformed.
    pub fn interim_steps(&self) -> Vec<InterimStep> {
        self.reconciled
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Agent,
    Human,
}

/// Metrics computed when a run leaves the running state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub answer: String,
    pub end_to_end_success: f64,
    pub step_accuracy: f64,
    pub total_steps: usize,
    pub human_steps: usize,
    pub agent_steps: usize,
    pub human_interventions: usize,
    pub last_step: Actor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLogEntry {
    pub event: String,
    pub elapsed_ms: u64,
}
