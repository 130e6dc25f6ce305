//! Accessibility snapshot → compact text report.
//!
//! The builder never fails. An empty [`Snapshot`] means the capture was not
//! usable yet (usually a page still loading) and the caller should retry.
//!
//! Report lines look like:
//!
//! ```text
//! [1744] link "HP CB782A#ABA 640 Inkjet Fax Machine (Renewed)"
//! 	[1749] StaticText "$279.49"
//! 	[1757] button "Add to Cart"
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{RawNode, Rect};

/// Captures with fewer unique nodes than this are treated as not ready.
pub const MIN_UNIQUE_NODES: usize = 10;

/// Accessibility properties that carry no signal for the agent.
const IGNORED_PROPERTIES: &[&str] = &[
    "focusable",
    "editable",
    "readonly",
    "level",
    "settable",
    "multiline",
    "invalid",
];

/// Roles that are pure layout when they have neither a name nor properties.
const DECORATIVE_ROLES: &[&str] = &[
    "generic",
    "img",
    "list",
    "strong",
    "paragraph",
    "banner",
    "navigation",
    "section",
    "labeltext",
    "legend",
    "listitem",
];

/// How many previously kept lines a static text is checked against.
const STATIC_TEXT_LOOKBACK: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub depth: usize,
    pub element_id: Option<i64>,
    pub role: String,
    pub name: String,
    pub properties: Vec<(String, String)>,
}

impl SnapshotEntry {
    /// The entry rendered without indentation.
    pub fn line(&self) -> String {
        let id = self.element_id.map(|id| id.to_string()).unwrap_or_default();
        let name = serde_json::to_string(&self.name).unwrap_or_else(|_| format!("\"{}\"", self.name));
        let mut line = format!("[{id}] {} {name}", self.role);
        for (key, value) in &self.properties {
            line.push(' ');
            line.push_str(key);
            line.push_str(": ");
            line.push_str(value);
        }
        line
    }

    fn is_static_text(&self) -> bool {
        self.role.eq_ignore_ascii_case("statictext")
    }
}

/// Per-node metadata kept alongside the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub backend_id: Option<i64>,
    pub bounds: Option<Rect>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
    pub nodes: HashMap<String, NodeInfo>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The report text: one tab-indented line per entry.
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .map(|entry| format!("{}{}", "\t".repeat(entry.depth), entry.line()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn find(&self, element_id: i64) -> Option<&SnapshotEntry> {
        self.entries
            .iter()
            .find(|entry| entry.element_id == Some(element_id))
    }
}

/// Build the report for one capture.
///
/// `viewport_only` restricts the report to elements whose marker says they
/// are inside the current viewport.
pub fn build_snapshot(raw: &[RawNode], viewport_only: bool) -> Snapshot {
    let nodes = dedupe(raw);
    if nodes.len() < MIN_UNIQUE_NODES {
        return Snapshot::default();
    }

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.node_id.as_str(), idx))
        .collect();

    let mut entries = Vec::new();
    let mut infos = HashMap::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root_of(&nodes, &index), 0usize)];

    while let Some((idx, depth)) = stack.pop() {
        let node = nodes[idx];
        if !visited.insert(idx) {
            continue;
        }

        let entry = entry_for(node, depth, viewport_only);
        let child_depth = match entry {
            Some(entry) => {
                infos.insert(
                    node.node_id.clone(),
                    NodeInfo {
                        backend_id: node.backend_id,
                        bounds: node.bounds,
                        text: entry.line(),
                    },
                );
                entries.push(entry);
                depth + 1
            }
            None => depth,
        };

        for child in node.child_ids.iter().rev() {
            if let Some(&child_idx) = index.get(child.as_str()) {
                stack.push((child_idx, child_depth));
            }
        }
    }

    Snapshot {
        entries: drop_repeated_static_text(entries),
        nodes: infos,
    }
}

/// The first node whose parent is not part of the capture. Falls back to the
/// first node.
fn root_of(nodes: &[&RawNode], index: &HashMap<&str, usize>) -> usize {
    nodes
        .iter()
        .position(|node| {
            node.parent_id
                .as_deref()
                .is_none_or(|parent| !index.contains_key(parent))
        })
        .unwrap_or(0)
}

fn dedupe(raw: &[RawNode]) -> Vec<&RawNode> {
    let mut seen = HashSet::new();
    raw.iter()
        .filter(|node| seen.insert(node.node_id.as_str()))
        .collect()
}

/// The entry a node contributes, or `None` when the node is not valid.
fn entry_for(node: &RawNode, depth: usize, viewport_only: bool) -> Option<SnapshotEntry> {
    let (Some(role), Some(name)) = (node.role.as_deref(), node.name.as_deref()) else {
        return None;
    };
    if viewport_only && !node.marker.is_some_and(|marker| marker.in_viewport) {
        return None;
    }

    let properties: Vec<(String, String)> = node
        .properties
        .iter()
        .filter(|(key, _)| !IGNORED_PROPERTIES.contains(&key.as_str()))
        .cloned()
        .collect();

    let decorative = DECORATIVE_ROLES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(role));
    if name.trim().is_empty() && properties.is_empty() && decorative {
        return None;
    }

    Some(SnapshotEntry {
        depth,
        element_id: node.marker.map(|marker| marker.element_id),
        role: role.to_string(),
        name: name.to_string(),
        properties,
    })
}

/// Drops static text already shown by one of the previous kept lines.
fn drop_repeated_static_text(entries: Vec<SnapshotEntry>) -> Vec<SnapshotEntry> {
    let mut kept: Vec<SnapshotEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_static_text() {
            if entry.name.is_empty() {
                continue;
            }
            let start = kept.len().saturating_sub(STATIC_TEXT_LOOKBACK);
            let repeated = kept[start..]
                .iter()
                .any(|prev| prev.line().contains(&entry.name));
            if repeated {
                continue;
            }
        }
        kept.push(entry);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::product_page;
    use crate::types::ElementMarker;

    #[test]
    fn renders_tab_indented_lines() {
        let snapshot = build_snapshot(&product_page(), true);
        let text = snapshot.text();
        assert_eq!(
            text,
            [
                "[1] RootWebArea \"Shop\"",
                "\t[1744] link \"HP CB782A#ABA 640 Inkjet Fax Machine (Renewed)\"",
                "\t\t[1749] StaticText \"$279.49\"",
                "\t[1757] button \"Add to Cart\"",
                "\t[3] heading \"Fax Machines\"",
                "\t[1760] button \"Add to Wish List\"",
            ]
            .join("\n")
        );
    }

    #[test]
    fn decorative_node_is_skipped_but_children_keep_its_depth() {
        let snapshot = build_snapshot(&product_page(), true);
        let link = snapshot.find(1744).unwrap();
        assert_eq!(link.depth, 1);
        assert!(snapshot.find(2).is_none());
    }

    #[test]
    fn fewer_than_ten_unique_nodes_is_not_ready() {
        let mut page = product_page();
        page.pop();
        // Duplicates do not count towards the minimum.
        page.push(page[0].clone());
        assert!(build_snapshot(&page, true).is_empty());
        assert_eq!(build_snapshot(&page, true).text(), "");
    }

    #[test]
    fn duplicate_ids_keep_the_first_occurrence() {
        let mut page = product_page();
        let mut dup = page[4].clone();
        dup.name = Some("Checkout".to_string());
        page.insert(1, dup.clone());
        page.push(dup);

        let snapshot = build_snapshot(&page, true);
        let ids: Vec<_> = snapshot.entries.iter().filter_map(|e| e.element_id).collect();
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(ids, unique);
        assert_eq!(snapshot.find(1757).unwrap().name, "Checkout");
        assert_eq!(ids.iter().filter(|&&id| id == 1757).count(), 1);
    }

    #[test]
    fn building_twice_is_identical() {
        let page = product_page();
        assert_eq!(build_snapshot(&page, true).text(), build_snapshot(&page, true).text());
    }

    #[test]
    fn offscreen_nodes_are_pruned_only_with_viewport_filter() {
        let mut page = product_page();
        page[4].marker = Some(ElementMarker {
            element_id: 1757,
            in_viewport: false,
        });
        assert!(build_snapshot(&page, true).find(1757).is_none());
        assert!(build_snapshot(&page, false).find(1757).is_some());
    }

    #[test]
    fn offscreen_parent_does_not_indent_children() {
        let mut page = product_page();
        page[3].marker = Some(ElementMarker {
            element_id: 1744,
            in_viewport: false,
        });
        let snapshot = build_snapshot(&page, true);
        assert_eq!(snapshot.find(1749).unwrap().depth, 1);
    }

    #[test]
    fn ignored_properties_are_filtered() {
        let mut page = product_page();
        page[4].properties = vec![
            ("focusable".to_string(), "true".to_string()),
            ("disabled".to_string(), "false".to_string()),
        ];
        let snapshot = build_snapshot(&page, true);
        assert_eq!(
            snapshot.find(1757).unwrap().line(),
            "[1757] button \"Add to Cart\" disabled: false"
        );
    }

    #[test]
    fn nameless_node_with_properties_is_kept() {
        let mut page = product_page();
        page[1].properties = vec![("expanded".to_string(), "true".to_string())];
        assert!(build_snapshot(&page, true).find(2).is_some());
    }

    #[test]
    fn node_without_name_is_invalid() {
        let mut page = product_page();
        page[2].name = None;
        assert!(build_snapshot(&page, true).find(3).is_none());
    }

    #[test]
    fn static_text_repeating_a_recent_line_is_dropped() {
        let snapshot = build_snapshot(&product_page(), true);
        assert!(snapshot.find(1761).is_none());
    }

    #[test]
    fn static_text_outside_the_lookback_is_kept() {
        let entries = vec![
            SnapshotEntry {
                depth: 0,
                element_id: Some(1),
                role: "StaticText".into(),
                name: "Price".into(),
                properties: vec![],
            },
            SnapshotEntry {
                depth: 0,
                element_id: Some(2),
                role: "button".into(),
                name: "a".into(),
                properties: vec![],
            },
            SnapshotEntry {
                depth: 0,
                element_id: Some(3),
                role: "button".into(),
                name: "b".into(),
                properties: vec![],
            },
            SnapshotEntry {
                depth: 0,
                element_id: Some(4),
                role: "button".into(),
                name: "c".into(),
                properties: vec![],
            },
            SnapshotEntry {
                depth: 0,
                element_id: Some(5),
                role: "StaticText".into(),
                name: "Price".into(),
                properties: vec![],
            },
        ];
        let kept = drop_repeated_static_text(entries);
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn cyclic_children_are_visited_once() {
        let mut page = product_page();
        page[5].child_ids = vec!["1".to_string(), "4".to_string()];
        let snapshot = build_snapshot(&page, true);
        assert_eq!(snapshot.entries.len(), 6);
    }

    #[test]
    fn node_info_records_kept_nodes() {
        let mut page = product_page();
        let rect = Rect {
            left: 5.0,
            top: 5.0,
            right: 45.0,
            bottom: 25.0,
        };
        page[5].bounds = Some(rect);
        let snapshot = build_snapshot(&page, true);
        assert_eq!(snapshot.nodes["6"].text, "[1749] StaticText \"$279.49\"");
        assert_eq!(snapshot.nodes["6"].bounds, Some(rect));
        assert!(!snapshot.nodes.contains_key("2"));
    }

    #[test]
    fn walk_starts_at_the_parentless_node() {
        let mut page = product_page();
        for node in page.iter_mut().skip(1) {
            node.parent_id = Some("1".to_string());
        }
        page.rotate_left(3);
        let snapshot = build_snapshot(&page, true);
        assert_eq!(snapshot.entries[0].line(), "[1] RootWebArea \"Shop\"");
        assert_eq!(snapshot.find(1749).unwrap().depth, 2);
    }
}
