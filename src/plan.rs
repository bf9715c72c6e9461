use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{DeskError, Result};
use crate::operator::Screenshot;

// ========================= Plan Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// What an action does. Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ActionKind {
    Move { x: i64, y: i64 },
    Click {
        #[serde(default)]
        button: MouseButton,
        #[serde(default)]
        double: bool,
    },
    /// Positive scrolls up.
    Scroll { amount: i64 },
    Input { text: String },
    Drag { from: Point, to: Point },
    Wait { ms: u64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction")]
pub struct AgentAction {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub kind: ActionKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentPlan {
    #[serde(default)]
    pub summary: String,
    pub actions: Vec<AgentAction>,
}

/// Model output shape before validation. Payloads stay loose until the
/// action type is known.
#[derive(Deserialize)]
struct RawAction {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<RawAction> for AgentAction {
    type Error = String;

    fn try_from(raw: RawAction) -> std::result::Result<Self, Self::Error> {
        let kind = match raw.kind.as_str() {
            "move" | "click" | "scroll" | "input" | "drag" | "wait" => {
                let payload = match raw.payload {
                    Value::Null => Value::Object(Default::default()),
                    other => other,
                };
                let tagged = serde_json::json!({ "type": raw.kind, "payload": payload });
                serde_json::from_value::<ActionKind>(tagged)
                    .map_err(|e| format!("invalid {} payload: {}", raw.kind, e))?
            }
            other => return Err(format!("unsupported action type: {}", other)),
        };
        let id = raw
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| nanoid!(8));
        Ok(AgentAction { id, description: raw.description, kind })
    }
}

// ========================= Prompting & Parsing =========================

pub fn build_prompt(user_prompt: &str, screenshot: Option<&Screenshot>) -> String {
    let screenshot = screenshot.map(Screenshot::data_url).unwrap_or_default();
    format!(
        r#"
You are UI-TARS, an expert GUI agent. Given a user request and a base64-encoded screenshot, plan a short action sequence to fulfill the request.

Rules:
- Output ONLY JSON in the schema:
{{
  "summary": "one-line summary",
  "actions": [
    {{
      "id": "step-1",
      "type": "move" | "click" | "scroll" | "input" | "drag" | "wait",
      "description": "what and where to do",
      "payload": {{}}
    }}
  ]
}}
- Payload per type:
  move:   {{"x": number, "y": number}}
  click:  {{"button": "left" | "right" | "middle", "double": boolean}}  (clicks at the current pointer)
  scroll: {{"amount": number}}  (positive scrolls up)
  input:  {{"text": string}}
  drag:   {{"from": {{"x": number, "y": number}}, "to": {{"x": number, "y": number}}}}
  wait:   {{"ms": number}}
- Keep 3-6 steps max.
- Coordinates are pixel positions relative to the screenshot (top-left origin).

User request:
{user_prompt}

Screenshot (data URL):
{screenshot}
"#
    )
}

/// Reads a plan out of raw model output: the first balanced `{...}` must be a
/// JSON object with an `actions` array of known action types.
pub fn parse_plan(raw: &str) -> Result<AgentPlan> {
    let slice = first_json_object(raw)
        .ok_or_else(|| DeskError::PlanUnparsable("no JSON object in model output".into()))?;
    let value: Value =
        serde_json::from_str(slice).map_err(|e| DeskError::PlanUnparsable(e.to_string()))?;
    if !value.get("actions").is_some_and(Value::is_array) {
        return Err(DeskError::PlanUnparsable("missing actions array".into()));
    }
    let plan: AgentPlan =
        serde_json::from_value(value).map_err(|e| DeskError::PlanUnparsable(e.to_string()))?;
    debug!(steps = plan.actions.len(), summary = %plan.summary, "parsed agent plan");
    Ok(plan)
}

/// Used whenever model output cannot be turned into a plan.
pub fn placeholder_plan() -> AgentPlan {
    AgentPlan {
        summary: "Fallback plan: click the top-left control and type text (local inference output was unusable)".into(),
        actions: vec![
            AgentAction {
                id: "1".into(),
                description: "Click the top-left button".into(),
                kind: ActionKind::Click { button: MouseButton::Left, double: false },
            },
            AgentAction {
                id: "2".into(),
                description: "Type text".into(),
                kind: ActionKind::Input { text: "Hello from MultiDesk".into() },
            },
        ],
    }
}

fn first_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
