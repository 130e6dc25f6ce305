//! Maps parsed actions onto primitive page operations.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Policy;
use crate::protocol::{Action, ScrollDirection};
use crate::remote::{ElementHandle, MouseEvent, MouseEventKind, RemoteControl, RemoteError};
use crate::types::{ObservationMetadata, Point};

const VERTICAL_SCROLL_PX: f64 = 400.0;
const HORIZONTAL_SCROLL_PX: f64 = 50.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{0} is not an executable action")]
    NotExecutable(&'static str),
}

pub struct Executor {
    remote: Arc<dyn RemoteControl>,
    keystroke_delay: Duration,
    click_settle: Duration,
}

impl Executor {
    pub fn new(remote: Arc<dyn RemoteControl>, policy: &Policy) -> Self {
        Self {
            remote,
            keystroke_delay: Duration::from_millis(policy.keystroke_delay_ms),
            click_settle: Duration::from_millis(policy.click_settle_ms),
        }
    }

    /// Perform `action` and describe the page afterwards.
    ///
    /// `snapshot` is the last report the agent saw; it is recorded as-is.
    pub async fn execute(
        &self,
        action: &Action,
        snapshot: &str,
    ) -> Result<ObservationMetadata, ExecutionError> {
        debug!(target: "hands", action = action.name(), "executing");
        match action {
            Action::Click { element_id } => {
                let (_, point) = self.locate(*element_id).await?;
                self.click_at(point, 1).await?;
                self.observe(action, Some(point), *element_id, snapshot).await
            }
            Action::SetValue { element_id, value } => {
                let (_, point) = self.locate(*element_id).await?;
                // Three clicks select whatever the field already holds.
                self.click_at(point, 3).await?;
                self.type_text(value).await?;
                self.remote.blur_active().await?;
                self.observe(action, Some(point), *element_id, snapshot).await
            }
            Action::Scroll { direction } => {
                let (dx, dy) = scroll_delta(*direction);
                self.remote.scroll_by(dx, dy).await?;
                self.observe(action, None, -1, snapshot).await
            }
            Action::Goto { url } => {
                self.remote.navigate(url).await?;
                Ok(ObservationMetadata {
                    document: String::new(),
                    snapshot: String::new(),
                    screenshot: self.screenshot().await,
                    action_kind: action.name().to_string(),
                    position: None,
                    element_id: -1,
                    url: url.clone(),
                })
            }
            Action::Finish | Action::FinishWithAnswer { .. } | Action::Fail => {
                Err(ExecutionError::NotExecutable(action.name()))
            }
        }
    }

    /// Point at the target of an element action and label it for the operator.
    ///
    /// Non-element actions have nothing to show and succeed immediately.
    pub async fn preview(&self, action: &Action) -> Result<(), ExecutionError> {
        let Some(element_id) = action.element_id() else {
            return Ok(());
        };
        let (_, point) = self.locate(element_id).await?;
        self.remote
            .dispatch_mouse(MouseEvent {
                kind: MouseEventKind::Moved,
                point,
                click_count: 0,
            })
            .await?;
        self.remote
            .show_tooltip(point, &format!("next action: {}", action.name()))
            .await?;
        Ok(())
    }

    async fn locate(&self, element_id: i64) -> Result<(ElementHandle, Point), ExecutionError> {
        let element = self.remote.resolve_element(element_id).await?;
        self.remote.scroll_into_view(&element).await?;
        tokio::time::sleep(self.click_settle).await;
        let point = self.remote.bounding_box(&element).await?.center();
        Ok((element, point))
    }

    async fn click_at(&self, point: Point, click_count: u32) -> Result<(), ExecutionError> {
        for kind in [MouseEventKind::Pressed, MouseEventKind::Released] {
            self.remote
                .dispatch_mouse(MouseEvent {
                    kind,
                    point,
                    click_count,
                })
                .await?;
        }
        tokio::time::sleep(self.click_settle).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), ExecutionError> {
        for c in text.chars() {
            self.remote.type_char(c).await?;
            tokio::time::sleep(self.keystroke_delay).await;
        }
        Ok(())
    }

    async fn observe(
        &self,
        action: &Action,
        position: Option<Point>,
        element_id: i64,
        snapshot: &str,
    ) -> Result<ObservationMetadata, ExecutionError> {
        Ok(ObservationMetadata {
            document: self.remote.document_html().await?,
            snapshot: snapshot.to_string(),
            screenshot: self.screenshot().await,
            action_kind: action.name().to_string(),
            position,
            element_id,
            url: self.remote.current_url().await?,
        })
    }

    async fn screenshot(&self) -> String {
        match self.remote.screenshot().await {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "hands", error = %err, "screenshot failed");
                String::new()
            }
        }
    }
}

fn scroll_delta(direction: ScrollDirection) -> (f64, f64) {
    match direction {
        ScrollDirection::Up => (0.0, -VERTICAL_SCROLL_PX),
        ScrollDirection::Down => (0.0, VERTICAL_SCROLL_PX),
        ScrollDirection::Left => (-HORIZONTAL_SCROLL_PX, 0.0),
        ScrollDirection::Right => (HORIZONTAL_SCROLL_PX, 0.0),
    }
}
