//! Operations the agent needs from the page it drives.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Point, RawNode, Rect};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("not attached to a page")]
    NotAttached,

    #[error("could not find node for element {0}")]
    NodeNotFound(i64),

    #[error("could not find object for element {0}")]
    ObjectNotFound(i64),

    #[error("could not find box model for element {0}")]
    NoBoxModel(i64),

    #[error("{0}")]
    Protocol(String),
}

impl RemoteError {
    /// Errors that a fresh attach can cure.
    pub fn is_detached(&self) -> bool {
        matches!(self, RemoteError::NotAttached)
    }
}

/// A live reference to a page element, valid until the next navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub element_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEventKind {
    Pressed,
    Released,
    Moved,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub point: Point,
    pub click_count: u32,
}

/// The remote control channel. The orchestrator is its only writer.
#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn attach(&self) -> Result<(), RemoteError>;
    async fn detach(&self) -> Result<(), RemoteError>;

    /// Stamp element markers onto the page and capture its accessibility tree.
    async fn capture_tree(&self) -> Result<Vec<RawNode>, RemoteError>;

    async fn resolve_element(&self, element_id: i64) -> Result<ElementHandle, RemoteError>;
    async fn scroll_into_view(&self, element: &ElementHandle) -> Result<(), RemoteError>;
    async fn bounding_box(&self, element: &ElementHandle) -> Result<Rect, RemoteError>;

    async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), RemoteError>;
    async fn type_char(&self, c: char) -> Result<(), RemoteError>;
    async fn blur_active(&self) -> Result<(), RemoteError>;
    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), RemoteError>;

    async fn navigate(&self, url: &str) -> Result<(), RemoteError>;
    /// Base64-encoded PNG of the viewport.
    async fn screenshot(&self) -> Result<String, RemoteError>;
    async fn current_url(&self) -> Result<String, RemoteError>;
    async fn document_html(&self) -> Result<String, RemoteError>;
    async fn show_tooltip(&self, point: Point, text: &str) -> Result<(), RemoteError>;
}
