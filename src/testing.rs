//! In-memory stand-ins for the page and the reasoning service.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::brain::{Completion, CompletionRequest, ProviderError, ReasoningService};
use crate::remote::{ElementHandle, MouseEvent, RemoteControl, RemoteError};
use crate::types::{ElementMarker, Point, RawNode, Rect, Usage};

pub const FAKE_USAGE: Usage = Usage {
    prompt_tokens: 10,
    completion_tokens: 5,
    total_tokens: 15,
};

pub fn node(id: &str, role: &str, name: &str, children: &[&str], element_id: i64) -> RawNode {
    RawNode {
        node_id: id.to_string(),
        role: Some(role.to_string()),
        name: Some(name.to_string()),
        child_ids: children.iter().map(|c| c.to_string()).collect(),
        marker: Some(ElementMarker {
            element_id,
            in_viewport: true,
        }),
        ..RawNode::default()
    }
}

/// A product page with exactly ten unique nodes.
pub fn product_page() -> Vec<RawNode> {
    vec![
        node("1", "RootWebArea", "Shop", &["2", "3", "9"], 1),
        node("2", "generic", "", &["4", "5"], 2),
        node("3", "heading", "Fax Machines", &[], 3),
        node("4", "link", "HP CB782A#ABA 640 Inkjet Fax Machine (Renewed)", &["6"], 1744),
        node("5", "button", "Add to Cart", &[], 1757),
        node("6", "StaticText", "$279.49", &[], 1749),
        node("7", "button", "orphan", &[], 7),
        node("8", "button", "orphan", &[], 8),
        node("9", "button", "Add to Wish List", &["10"], 1760),
        node("10", "StaticText", "Add to Wish List", &[], 1761),
    ]
}

/// Replays canned replies in order, repeating the last one once exhausted.
pub struct ScriptedService {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    last: Mutex<Option<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedService {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningService for ScriptedService {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(ProviderError::Fatal("script is empty".into()))),
        };
        reply.map(|text| Completion {
            text,
            usage: FAKE_USAGE,
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

struct FakePage {
    attached: bool,
    refuse_attach: u32,
    drop_on: Option<(String, u32)>,
    tree: Vec<RawNode>,
    elements: HashMap<i64, Rect>,
    url: String,
    screenshots_fail: bool,
    calls: Vec<String>,
}

/// A scriptable page that records every primitive call as a short string.
pub struct FakeRemote {
    page: Mutex<FakePage>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::with_tree(Vec::new())
    }

    /// A page serving `tree` with an element entry for every marked node.
    pub fn with_tree(tree: Vec<RawNode>) -> Self {
        let elements = tree
            .iter()
            .filter_map(|node| node.marker)
            .map(|marker| {
                let offset = marker.element_id as f64;
                let rect = Rect {
                    left: offset,
                    top: offset,
                    right: offset + 10.0,
                    bottom: offset + 10.0,
                };
                (marker.element_id, rect)
            })
            .collect();
        Self {
            page: Mutex::new(FakePage {
                attached: true,
                refuse_attach: 0,
                drop_on: None,
                tree,
                elements,
                url: "https://shop.example/fax".to_string(),
                screenshots_fail: false,
                calls: Vec::new(),
            }),
        }
    }

    pub fn add_element(&self, element_id: i64, rect: Rect) {
        self.page.lock().unwrap().elements.insert(element_id, rect);
    }

    pub fn fail_screenshots(&self) {
        self.page.lock().unwrap().screenshots_fail = true;
    }

    /// Refuse the next `n` attach requests.
    pub fn refuse_attach(&self, n: u32) {
        self.page.lock().unwrap().refuse_attach = n;
    }

    /// Lose the attachment on the next call starting with `prefix`, which
    /// then fails, and refuse the following `refuse` attach requests.
    pub fn drop_on_next(&self, prefix: &str, refuse: u32) {
        self.page.lock().unwrap().drop_on = Some((prefix.to_string(), refuse));
    }

    pub fn attached(&self) -> bool {
        self.page.lock().unwrap().attached
    }

    pub fn url(&self) -> String {
        self.page.lock().unwrap().url.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.page.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) -> Result<(), RemoteError> {
        let mut page = self.page.lock().unwrap();
        let dropped = page
            .drop_on
            .as_ref()
            .is_some_and(|(prefix, _)| call.starts_with(prefix.as_str()));
        if dropped {
            let refuse = page.drop_on.take().map_or(0, |(_, refuse)| refuse);
            page.attached = false;
            page.refuse_attach = refuse;
        }
        page.calls.push(call);
        if page.attached {
            Ok(())
        } else {
            Err(RemoteError::NotAttached)
        }
    }
}

#[async_trait]
impl RemoteControl for FakeRemote {
    async fn attach(&self) -> Result<(), RemoteError> {
        let mut page = self.page.lock().unwrap();
        page.calls.push("attach".to_string());
        if page.refuse_attach > 0 {
            page.refuse_attach -= 1;
            return Err(RemoteError::Protocol("target closed".to_string()));
        }
        page.attached = true;
        Ok(())
    }

    async fn detach(&self) -> Result<(), RemoteError> {
        let mut page = self.page.lock().unwrap();
        page.calls.push("detach".to_string());
        page.attached = false;
        Ok(())
    }

    async fn capture_tree(&self) -> Result<Vec<RawNode>, RemoteError> {
        self.record("capture_tree".to_string())?;
        Ok(self.page.lock().unwrap().tree.clone())
    }

    async fn resolve_element(&self, element_id: i64) -> Result<ElementHandle, RemoteError> {
        self.record(format!("resolve {element_id}"))?;
        if self.page.lock().unwrap().elements.contains_key(&element_id) {
            Ok(ElementHandle { element_id })
        } else {
            Err(RemoteError::NodeNotFound(element_id))
        }
    }

    async fn scroll_into_view(&self, element: &ElementHandle) -> Result<(), RemoteError> {
        self.record(format!("scroll_into_view {}", element.element_id))
    }

    async fn bounding_box(&self, element: &ElementHandle) -> Result<Rect, RemoteError> {
        self.record(format!("bounding_box {}", element.element_id))?;
        self.page
            .lock()
            .unwrap()
            .elements
            .get(&element.element_id)
            .copied()
            .ok_or(RemoteError::NoBoxModel(element.element_id))
    }

    async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), RemoteError> {
        self.record(format!(
            "mouse {:?} {},{} x{}",
            event.kind, event.point.x, event.point.y, event.click_count
        ))
    }

    async fn type_char(&self, c: char) -> Result<(), RemoteError> {
        self.record(format!("type {c}"))
    }

    async fn blur_active(&self) -> Result<(), RemoteError> {
        self.record("blur".to_string())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), RemoteError> {
        self.record(format!("scroll_by {dx},{dy}"))
    }

    async fn navigate(&self, url: &str) -> Result<(), RemoteError> {
        self.record(format!("navigate {url}"))?;
        self.page.lock().unwrap().url = url.to_string();
        Ok(())
    }

    async fn screenshot(&self) -> Result<String, RemoteError> {
        self.record("screenshot".to_string())?;
        if self.page.lock().unwrap().screenshots_fail {
            Err(RemoteError::Protocol("capture failed".to_string()))
        } else {
            Ok("iVBORw0KGgo=".to_string())
        }
    }

    async fn current_url(&self) -> Result<String, RemoteError> {
        self.record("current_url".to_string())?;
        Ok(self.url())
    }

    async fn document_html(&self) -> Result<String, RemoteError> {
        self.record("document_html".to_string())?;
        Ok("<html><body>shop</body></html>".to_string())
    }

    async fn show_tooltip(&self, point: Point, text: &str) -> Result<(), RemoteError> {
        self.record(format!("tooltip {},{} {text}", point.x, point.y))
    }
}
