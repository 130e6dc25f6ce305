//! Action vocabulary and the text protocol spoken with the reasoning service.
//!
//! The service answers with a thought and an action wrapped in tags:
//!
//! ```text
//! <Thought>The search box is [164].</Thought><Action>setvalue(164, "restaurants near CMU")</Action>
//! ```

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::HistoryEntry;

/// Requests stop at the closing action tag; it is re-appended afterwards.
pub const STOP_SEQUENCE: &str = "</Action>";

pub const DEFAULT_THOUGHT: &str = "I will perform the following action:";

const REJECTED_PREFIX: &str = "The user rejected the last action and performed the following actions:";

static THOUGHT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Thought>(.*?)</Thought>").expect("valid regex"));
static THOUGHT_TAG_ANY_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<thought>(.*?)</thought>").expect("valid regex"));
static ACTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Action>(.*?)</Action>").expect("valid regex"));
static ACTION_TAG_ANY_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<action>(.*?)</action>").expect("valid regex"));
static CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(\w+)\((.*)\)").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }
}

impl FromStr for ScrollDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "left" => Ok(ScrollDirection::Left),
            "right" => Ok(ScrollDirection::Right),
            _ => Err(()),
        }
    }
}

/// A validated command from the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "lowercase")]
pub enum Action {
    Click { element_id: i64 },
    Scroll { direction: ScrollDirection },
    SetValue { element_id: i64, value: String },
    Goto { url: String },
    Finish,
    FinishWithAnswer { answer: String },
    Fail,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Scroll { .. } => "scroll",
            Action::SetValue { .. } => "setvalue",
            Action::Goto { .. } => "goto",
            Action::Finish => "finish",
            Action::FinishWithAnswer { .. } => "finishwithanswer",
            Action::Fail => "fail",
        }
    }

    /// `finish` and `finishwithanswer` end the run successfully.
    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish | Action::FinishWithAnswer { .. })
    }

    pub fn element_id(&self) -> Option<i64> {
        match self {
            Action::Click { element_id } | Action::SetValue { element_id, .. } => Some(*element_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Number,
    Text,
}

#[derive(Debug, Clone, Copy)]
struct ArgSpec {
    name: &'static str,
    kind: ArgKind,
}

/// Declared schema of one action.
#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    args: &'static [ArgSpec],
}

impl ActionSpec {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    fn signature(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|arg| {
                let kind = match arg.kind {
                    ArgKind::Number => "number",
                    ArgKind::Text => "string",
                };
                format!("{}: {kind}", arg.name)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({args})", self.name)
    }
}

const ELEMENT_ID: ArgSpec = ArgSpec {
    name: "elementId",
    kind: ArgKind::Number,
};

pub const AVAILABLE_ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "click",
        description: "Clicks on an element",
        args: &[ELEMENT_ID],
    },
    ActionSpec {
        name: "scroll",
        description: "Scroll in a given direction (up/down/left/right). Only use it when the target \
                      element is not in the viewport and scrolling might expose it. Never scroll indefinitely.",
        args: &[ArgSpec {
            name: "direction",
            kind: ArgKind::Text,
        }],
    },
    ActionSpec {
        name: "setvalue",
        description: "Focuses on and sets the value of an input element",
        args: &[
            ELEMENT_ID,
            ArgSpec {
                name: "value",
                kind: ArgKind::Text,
            },
        ],
    },
    ActionSpec {
        name: "goto",
        description: "Navigate to a specific URL",
        args: &[ArgSpec {
            name: "url",
            kind: ArgKind::Text,
        }],
    },
    ActionSpec {
        name: "finish",
        description: "Indicates the task is finished",
        args: &[],
    },
    ActionSpec {
        name: "finishwithanswer",
        description: "Finish the task by responding with the desired answer to a user query",
        args: &[ArgSpec {
            name: "answer",
            kind: ArgKind::Text,
        }],
    },
    ActionSpec {
        name: "fail",
        description: "Indicates that you are unable to complete the task",
        args: &[],
    },
];

pub fn action_spec(name: &str) -> Option<&'static ActionSpec> {
    AVAILABLE_ACTIONS.iter().find(|spec| spec.name == name)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid response: Action not found in the model response.")]
    MissingAction,

    #[error("Invalid action format: Action should be in the format functionName(arg1, arg2, ...).")]
    BadFormat,

    #[error("Invalid action: \"{0}\" is not a valid action.")]
    UnknownAction(String),

    #[error("Invalid number of arguments: Expected {expected} for action \"{action}\", but got {got}.")]
    ArgumentCount {
        action: String,
        expected: usize,
        got: usize,
    },

    #[error("Invalid argument type: Expected a number for argument \"{arg}\", but got \"{got}\".")]
    ExpectedNumber { arg: String, got: String },

    #[error("Invalid argument type: Expected a string for argument \"{arg}\", but got \"{got}\".")]
    ExpectedString { arg: String, got: String },

    #[error("Invalid argument value for \"{arg}\": \"{got}\".")]
    InvalidValue { arg: String, got: String },
}

/// A successfully parsed reasoning-service response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub thought: String,
    /// The raw text between the action tags.
    pub action_text: String,
    pub action: Action,
}

/// System prompt describing the vocabulary, the rules and two examples.
pub fn system_prompt() -> String {
    let tools = AVAILABLE_ACTIONS
        .iter()
        .enumerate()
        .map(|(i, spec)| format!("{}. {}: {}", i + 1, spec.signature(), spec.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are an autonomous agent operating a web browser on behalf of a user.
Each turn you receive:
Task: what the user wants to achieve.
Current page contents: a simplified accessibility view of the visible page; every element starts with its [id].
Previous actions: what you, and the user when they took over, already did.

You can use the following tools:
{tools}

Rules:
1. Only issue an action that is valid for the current page contents.
2. Issue exactly one action per turn.
3. Reason step by step in the thought, then give the action.
4. Always include BOTH <Thought></Thought> and <Action></Action> tags or your response is invalid.
5. The previous actions include what the user did. Never repeat an action the user rejected and build on the steps the user performed.

Example:
Current page contents:
[1744] link "HP CB782A#ABA 640 Inkjet Fax Machine (Renewed)"
	[1749] StaticText "$279.49"
	[1757] button "Add to Cart"
Task: What is the price of HP Inkjet Fax Machine
Previous actions:
<Thought>The page lists the HP Inkjet Fax Machine and its price is $279.49. The objective is achieved.</Thought><Action>finishwithanswer("$279.49")</Action>

Example:
Current page contents:
[164] textbox "Search" focused: true required: false
[171] button "Go"
Task: Show me the restaurants near CMU
Previous actions:
<Thought>The search box is [164]. Searching for "restaurants near CMU" lists them.</Thought><Action>setvalue(164, "restaurants near CMU")</Action>"#
    )
}

/// Prompt for one query: task, current snapshot and the trace so far.
pub fn format_prompt(instructions: &str, history: &[HistoryEntry], snapshot_text: &str) -> String {
    let trace = history
        .iter()
        .map(|entry| {
            let mut step = format!(
                "<Thought>{}</Thought>\n<Action>{}</Action>",
                entry.parsed.thought, entry.parsed.action_text
            );
            let interim = entry.interim_steps();
            if !interim.is_empty() {
                step.push_str(REJECTED_PREFIX);
                for item in interim {
                    step.push_str(&format!(
                        "\n<Thought>{}</Thought>\n<Action>{}</Action>",
                        item.thought, item.action
                    ));
                }
            }
            step
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "The user requests the following task: {instructions}\nCurrent page contents: {snapshot_text}\nPrevious actions: {trace}"
    )
}

/// Whether a raw response carries an action tag at all.
pub fn has_action_tag(text: &str) -> bool {
    text.to_ascii_lowercase().contains("<action>")
}

pub fn parse_response(text: &str) -> Result<ParsedResponse, ParseError> {
    let thought = THOUGHT_TAG
        .captures(text)
        .or_else(|| THOUGHT_TAG_ANY_CASE.captures(text))
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| DEFAULT_THOUGHT.to_string());

    let action_text = ACTION_TAG
        .captures(text)
        .or_else(|| ACTION_TAG_ANY_CASE.captures(text))
        .map(|caps| caps[1].to_string())
        .ok_or(ParseError::MissingAction)?;

    let action = parse_action(&action_text)?;
    Ok(ParsedResponse {
        thought,
        action_text,
        action,
    })
}

/// Parse `name(args)` against the vocabulary.
pub fn parse_action(action_text: &str) -> Result<Action, ParseError> {
    let caps = CALL.captures(action_text).ok_or(ParseError::BadFormat)?;
    let name = caps[1].to_string();
    let raw_args = caps[2].trim();

    let spec = action_spec(&name).ok_or_else(|| ParseError::UnknownAction(name.clone()))?;

    // The answer is free text; commas inside it are not separators.
    if spec.name == "finishwithanswer" {
        let answer = unquote(raw_args).unwrap_or(raw_args);
        return Ok(Action::FinishWithAnswer {
            answer: answer.to_string(),
        });
    }

    let args = split_args(raw_args);
    if args.len() != spec.arity() {
        return Err(ParseError::ArgumentCount {
            action: name,
            expected: spec.arity(),
            got: args.len(),
        });
    }

    let mut values = Vec::with_capacity(args.len());
    for (arg, schema) in args.iter().zip(spec.args) {
        values.push(coerce(arg, schema)?);
    }

    let action = match (spec.name, values.as_slice()) {
        ("click", [ArgValue::Number(element_id)]) => Action::Click {
            element_id: *element_id,
        },
        ("scroll", [ArgValue::Text(direction)]) => Action::Scroll {
            direction: direction.parse().map_err(|_| ParseError::InvalidValue {
                arg: "direction".to_string(),
                got: direction.clone(),
            })?,
        },
        ("setvalue", [ArgValue::Number(element_id), ArgValue::Text(value)]) => Action::SetValue {
            element_id: *element_id,
            value: value.clone(),
        },
        ("goto", [ArgValue::Text(url)]) => Action::Goto { url: url.clone() },
        ("finish", []) => Action::Finish,
        ("fail", []) => Action::Fail,
        _ => return Err(ParseError::BadFormat),
    };
    Ok(action)
}

enum ArgValue {
    Number(i64),
    Text(String),
}

fn coerce(arg: &str, schema: &ArgSpec) -> Result<ArgValue, ParseError> {
    match schema.kind {
        ArgKind::Number => arg
            .parse::<i64>()
            .map(ArgValue::Number)
            .map_err(|_| ParseError::ExpectedNumber {
                arg: schema.name.to_string(),
                got: arg.to_string(),
            }),
        ArgKind::Text => unquote(arg)
            .map(|value| ArgValue::Text(value.to_string()))
            .ok_or_else(|| ParseError::ExpectedString {
                arg: schema.name.to_string(),
                got: arg.to_string(),
            }),
    }
}

/// Strip one matching pair of `"`, `'` or backtick quotes.
fn unquote(arg: &str) -> Option<&str> {
    let mut chars = arg.chars();
    let first = chars.next()?;
    let last = chars.next_back()?;
    if first == last && matches!(first, '"' | '\'' | '`') {
        Some(&arg[1..arg.len() - 1])
    } else {
        None
    }
}

/// Split on commas that are not inside a quoted string.
fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in raw.chars() {
        match quote {
            Some(open) if c == open => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if matches!(c, '"' | '\'' | '`') => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => args.push(std::mem::take(&mut current)),
            None => current.push(c),
        }
    }
    args.push(current);

    args.into_iter()
        .map(|arg| arg.trim().to_string())
        .filter(|arg| !arg.is_empty())
        .collect()
}
