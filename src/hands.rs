//! Chrome over the DevTools protocol, via `headless_chrome`.
//!
//! Every protocol call blocks, so each one runs on the blocking pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use headless_chrome::browser::tab::point::Point as ChromePoint;
use headless_chrome::protocol::cdp::{Accessibility, Input, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tracing::{info, warn};

use crate::remote::{ElementHandle, MouseEvent, MouseEventKind, RemoteControl, RemoteError};
use crate::types::{ElementMarker, Point, RawNode, Rect};

/// Attribute carrying the element id the agent refers to.
const ELEMENT_ID_ATTR: &str = "data-webpilot-id";

/// Numbers every element and records whether it is inside the viewport.
///
/// The `aria-labelledby` value ends up in the accessibility name sources,
/// which is how a captured node is matched back to its element. Returns the
/// bounding rectangles keyed by element id, as JSON.
const ANNOTATE_JS: &str = r#"
(() => {
  const width = window.innerWidth || document.documentElement.clientWidth;
  const height = window.innerHeight || document.documentElement.clientHeight;
  const all = document.body ? document.body.getElementsByTagName('*') : [];
  const rects = {};
  let count = 0;
  for (const el of all) {
    if (!(el instanceof HTMLElement)) continue;
    count += 1;
    el.setAttribute('data-webpilot-id', String(count));
    const r = el.getBoundingClientRect();
    const visible = r.width > 0 && r.height > 0 &&
      r.bottom > 0 && r.right > 0 && r.top < height && r.left < width;
    el.setAttribute('aria-labelledby', count + '_' + (visible ? 1 : 0));
    rects[count] = { left: r.left, top: r.top, right: r.right, bottom: r.bottom };
  }
  return JSON.stringify(rects);
})()
"#;

const SCROLL_INTO_VIEW_JS: &str =
    "function() { this.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' }); }";

const BOUNDING_RECT_JS: &str = "function() { const r = this.getBoundingClientRect(); \
     return JSON.stringify({ left: r.left, top: r.top, right: r.right, bottom: r.bottom }); }";

const BLUR_JS: &str = "document.activeElement && document.activeElement.blur && document.activeElement.blur()";

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// DevTools endpoint of an already running Chrome, tried before launching.
    pub attach_url: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Profile directory for a launched Chrome; logins persist across runs.
    pub profile_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            attach_url: Some("http://127.0.0.1:9222".to_string()),
            headless: false,
            chrome_path: None,
            profile_dir: PathBuf::from("agent_profile"),
        }
    }
}

/// Browser process plus the tab the agent drives.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    /// Attach to a running Chrome when possible, otherwise launch one.
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        if let Some(url) = &config.attach_url {
            info!(target: "hands", %url, "attempting to attach to existing chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser.get_tabs();
                        let tabs = tabs
                            .lock()
                            .map_err(|_| anyhow::anyhow!("browser tab list poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    info!(target: "hands", "attached to existing chrome");
                    return Ok(Self {
                        _browser: browser,
                        tab,
                    });
                }
                Err(err) => warn!(target: "hands", error = %err, "could not attach, launching"),
            }
        }

        std::fs::create_dir_all(&config.profile_dir)?;
        let path = config.chrome_path.clone().or_else(find_chrome);
        let options = LaunchOptions {
            headless: config.headless,
            path,
            user_data_dir: Some(config.profile_dir.clone()),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
                std::ffi::OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: std::time::Duration::from_secs(600),
            ..Default::default()
        };

        info!(target: "hands", profile = %config.profile_dir.display(), "starting chrome");
        let browser =
            Browser::new(options).map_err(|e| anyhow::anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!(target: "hands", "chrome ready");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// A control channel over the current tab.
    pub fn channel(&self) -> ChromeChannel {
        ChromeChannel::new(self.tab.clone())
    }
}

fn find_chrome() -> Option<PathBuf> {
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "Default".to_string());
    let candidates = [
        r"C:\Program Files\Google\Chrome\Application\chrome.exe".to_string(),
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe".to_string(),
        format!(r"C:\Users\{user}\AppData\Local\Google\Chrome\Application\chrome.exe"),
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".to_string(),
        "/usr/bin/google-chrome".to_string(),
        "/usr/bin/chromium".to_string(),
        "/usr/bin/chromium-browser".to_string(),
    ];
    // Unknown layouts fall through to headless_chrome's own lookup.
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// [`RemoteControl`] over one Chrome tab.
pub struct ChromeChannel {
    tab: Arc<Tab>,
    attached: AtomicBool,
}

impl ChromeChannel {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self {
            tab,
            attached: AtomicBool::new(false),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&Tab) -> Result<T, RemoteError> + Send + 'static,
        T: Send + 'static,
    {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(RemoteError::NotAttached);
        }
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| RemoteError::Protocol(format!("browser task panicked: {e}")))?
    }
}

fn protocol(err: impl std::fmt::Display) -> RemoteError {
    RemoteError::Protocol(err.to_string())
}

fn selector(element_id: i64) -> String {
    format!("[{ELEMENT_ID_ATTR}=\"{element_id}\"]")
}

/// Parse the `"<id>_<flag>"` label stamped by [`ANNOTATE_JS`].
fn parse_marker(label: &str) -> Option<ElementMarker> {
    let (id, flag) = label.trim().split_once('_')?;
    Some(ElementMarker {
        element_id: id.parse().ok()?,
        in_viewport: flag == "1",
    })
}

/// Element rectangles returned by [`ANNOTATE_JS`]. Unreadable output yields
/// no rectangles rather than an error.
fn parse_rects(json: &str) -> HashMap<i64, Rect> {
    let Ok(raw) = serde_json::from_str::<HashMap<String, Rect>>(json) else {
        return HashMap::new();
    };
    raw.into_iter()
        .filter_map(|(id, rect)| Some((id.parse().ok()?, rect)))
        .collect()
}

fn ax_text(value: Option<&Accessibility::AXValue>) -> Option<String> {
    let value = value?.value.as_ref()?;
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn marker_of(node: &Accessibility::AXNode) -> Option<ElementMarker> {
    let sources = node.name.as_ref()?.sources.as_ref()?;
    sources
        .iter()
        .filter(|source| source.attribute.as_deref() == Some("aria-labelledby"))
        .find_map(|source| {
            let label = source.attribute_value.as_ref()?.value.as_ref()?.as_str()?;
            parse_marker(label)
        })
}

fn raw_node(node: &Accessibility::AXNode) -> RawNode {
    let properties = node
        .properties
        .as_ref()
        .map(|props| {
            props
                .iter()
                .filter_map(|prop| {
                    let name = serde_json::to_value(&prop.name).ok()?;
                    let name = name.as_str()?.to_string();
                    Some((name, ax_text(Some(&prop.value)).unwrap_or_default()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawNode {
        node_id: node.node_id.clone(),
        role: ax_text(node.role.as_ref()),
        name: ax_text(node.name.as_ref()),
        properties,
        child_ids: node.child_ids.clone().unwrap_or_default(),
        parent_id: node.parent_id.clone(),
        backend_id: node.backend_dom_node_id.map(|id| id as i64),
        bounds: None,
        marker: marker_of(node),
    }
}

fn mouse_button_event(tab: &Tab, event: MouseEvent) -> Result<(), RemoteError> {
    let kind = match event.kind {
        MouseEventKind::Pressed => Input::DispatchMouseEventTypeOption::MousePressed,
        MouseEventKind::Released => Input::DispatchMouseEventTypeOption::MouseReleased,
        MouseEventKind::Moved => {
            tab.move_mouse_to_point(ChromePoint {
                x: event.point.x,
                y: event.point.y,
            })
            .map_err(protocol)?;
            return Ok(());
        }
    };
    tab.call_method(Input::DispatchMouseEvent {
        Type: kind,
        x: event.point.x,
        y: event.point.y,
        modifiers: None,
        timestamp: None,
        button: Some(Input::MouseButton::Left),
        buttons: None,
        click_count: Some(event.click_count),
        force: None,
        tangential_pressure: None,
        tilt_x: None,
        tilt_y: None,
        twist: None,
        delta_x: None,
        delta_y: None,
        pointer_Type: None,
    })
    .map_err(protocol)?;
    Ok(())
}

#[async_trait]
impl RemoteControl for ChromeChannel {
    async fn attach(&self) -> Result<(), RemoteError> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || tab.evaluate("1", false).map(|_| ()))
            .await
            .map_err(protocol)?
            .map_err(protocol)?;
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn detach(&self) -> Result<(), RemoteError> {
        self.attached.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_tree(&self) -> Result<Vec<RawNode>, RemoteError> {
        self.blocking(|tab| {
            let stamped = tab.evaluate(ANNOTATE_JS, false).map_err(protocol)?;
            let rects = stamped
                .value
                .as_ref()
                .and_then(Value::as_str)
                .map(parse_rects)
                .unwrap_or_default();
            let tree = tab
                .call_method(Accessibility::GetFullAXTree {
                    depth: None,
                    frame_id: None,
                })
                .map_err(protocol)?;
            Ok(tree
                .nodes
                .iter()
                .map(|node| {
                    let mut raw = raw_node(node);
                    raw.bounds = raw
                        .marker
                        .and_then(|marker| rects.get(&marker.element_id).copied());
                    raw
                })
                .collect())
        })
        .await
    }

    async fn resolve_element(&self, element_id: i64) -> Result<ElementHandle, RemoteError> {
        self.blocking(move |tab| {
            tab.find_element(&selector(element_id))
                .map_err(|_| RemoteError::NodeNotFound(element_id))?;
            Ok(ElementHandle { element_id })
        })
        .await
    }

    async fn scroll_into_view(&self, element: &ElementHandle) -> Result<(), RemoteError> {
        let element_id = element.element_id;
        self.blocking(move |tab| {
            let element = tab
                .find_element(&selector(element_id))
                .map_err(|_| RemoteError::ObjectNotFound(element_id))?;
            element
                .call_js_fn(SCROLL_INTO_VIEW_JS, vec![], false)
                .map_err(protocol)?;
            Ok(())
        })
        .await
    }

    async fn bounding_box(&self, element: &ElementHandle) -> Result<Rect, RemoteError> {
        let element_id = element.element_id;
        self.blocking(move |tab| {
            let element = tab
                .find_element(&selector(element_id))
                .map_err(|_| RemoteError::ObjectNotFound(element_id))?;
            let result = element
                .call_js_fn(BOUNDING_RECT_JS, vec![], false)
                .map_err(|_| RemoteError::NoBoxModel(element_id))?;
            let json = result
                .value
                .as_ref()
                .and_then(Value::as_str)
                .ok_or(RemoteError::NoBoxModel(element_id))?;
            serde_json::from_str(json).map_err(|_| RemoteError::NoBoxModel(element_id))
        })
        .await
    }

    async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), RemoteError> {
        self.blocking(move |tab| mouse_button_event(tab, event)).await
    }

    async fn type_char(&self, c: char) -> Result<(), RemoteError> {
        self.blocking(move |tab| {
            tab.type_str(&c.to_string()).map_err(protocol)?;
            Ok(())
        })
        .await
    }

    async fn blur_active(&self) -> Result<(), RemoteError> {
        self.blocking(|tab| {
            tab.evaluate(BLUR_JS, false).map_err(protocol)?;
            Ok(())
        })
        .await
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<(), RemoteError> {
        self.blocking(move |tab| {
            tab.evaluate(&format!("window.scrollBy({dx}, {dy})"), false)
                .map_err(protocol)?;
            Ok(())
        })
        .await
    }

    async fn navigate(&self, url: &str) -> Result<(), RemoteError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url).map_err(protocol)?;
            tab.wait_until_navigated().map_err(protocol)?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self) -> Result<String, RemoteError> {
        self.blocking(|tab| {
            let png = tab
                .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(protocol)?;
            Ok(STANDARD.encode(png))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, RemoteError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn document_html(&self) -> Result<String, RemoteError> {
        self.blocking(|tab| tab.get_content().map_err(protocol)).await
    }

    async fn show_tooltip(&self, point: Point, text: &str) -> Result<(), RemoteError> {
        let text = serde_json::to_string(text).map_err(protocol)?;
        let script = format!(
            r#"(() => {{
  let tip = document.getElementById('webpilot-tooltip');
  if (!tip) {{
    tip = document.createElement('div');
    tip.id = 'webpilot-tooltip';
    tip.style.cssText = 'position:fixed;z-index:2147483647;pointer-events:none;padding:4px 8px;' +
      'background:#222;color:#fff;font:12px sans-serif;border-radius:4px;';
    document.body.appendChild(tip);
  }}
  tip.textContent = {text};
  tip.style.left = '{x}px';
  tip.style.top = '{y}px';
}})()"#,
            x = point.x + 12.0,
            y = point.y + 12.0,
        );
        self.blocking(move |tab| {
            tab.evaluate(&script, false).map_err(protocol)?;
            Ok(())
        })
        .await
    }
}
