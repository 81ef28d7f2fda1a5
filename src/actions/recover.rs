//! Tolerant recovery of a validated [`Action`] from raw model output.
//!
//! Two tiers, deliberately kept separate: a strict structured parse over a
//! small set of extraction candidates, then a best-effort regex field
//! extraction. A response that only survives the second tier is logged as
//! degraded so the difference stays visible in the logs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::types::{Action, ActionError, AiResponse};

/// Recovery errors.
#[derive(Error, Debug)]
pub enum RecoverError {
    #[error("Malformed JSON in model response: {0}")]
    MalformedJson(String),
    #[error("Invalid action format: {0}")]
    ActionFormat(#[from] ActionError),
}

/// Duration of the wait an empty shell command is downgraded to.
const EMPTY_SHELL_WAIT_MS: f64 = 1000.0;

/// Convert raw completion text into a validated response.
///
/// # Arguments
/// * `raw` - The full text returned by the model, fences and prose included.
///
/// # Returns
/// The parsed thought and normalized, validated action.
pub fn recover_response(raw: &str) -> Result<AiResponse, RecoverError> {
    let value = parse_candidates(raw)
        .or_else(|| {
            let recovered = recover_fields(raw);
            if recovered.is_some() {
                tracing::warn!("structured parse failed, recovered fields from raw text");
            }
            recovered
        })
        .ok_or_else(|| {
            RecoverError::MalformedJson(format!(
                "no action recoverable from response: {}",
                truncate_for_log(raw)
            ))
        })?;

    let thought = value
        .get("thought")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let action_value = value.get("action").cloned().unwrap_or(Value::Null);
    let action = normalize_and_validate(action_value, &value)?;

    Ok(AiResponse { thought, action })
}

/// Try the structured extraction candidates in order; first JSON object wins.
fn parse_candidates(raw: &str) -> Option<Value> {
    let stripped = strip_code_fences(raw);

    let mut candidates: Vec<String> = vec![stripped.to_string()];

    // Substring between the first '{' and the last '}'.
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            candidates.push(raw[start..=end].to_string());
        }
    }

    // First balanced object span, tolerating trailing prose after valid JSON.
    if let Some(span) = balanced_object_span(raw) {
        candidates.push(span.to_string());
    }

    candidates.iter().find_map(|c| {
        serde_json::from_str::<Value>(c.trim())
            .ok()
            .filter(|v| v.is_object())
    })
}

/// Remove ```json ... ``` style fence wrappers.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Find the first balanced `{...}` span by depth counting.
///
/// String literals and escape sequences are honored so braces inside quoted
/// text do not confuse the depth counter.
fn balanced_object_span(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

static FIELD_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let string_field = |name: &str| {
        Regex::new(&format!(r#""?{name}"?\s*[:=]\s*"((?:[^"\\]|\\.)*)""#)).unwrap()
    };
    let number_field = |name: &str| {
        Regex::new(&format!(r#""?{name}"?\s*[:=]\s*(-?\d+(?:\.\d+)?)"#)).unwrap()
    };
    vec![
        ("action", string_field("action")),
        ("thought", string_field("thought")),
        ("text", string_field("text")),
        ("x", number_field("x")),
        ("y", number_field("y")),
        ("end_x", number_field("end_x")),
        ("end_y", number_field("end_y")),
        ("duration", number_field("duration")),
        ("hold_seconds", number_field("hold_seconds")),
        ("scroll_amount", number_field("scroll_amount")),
        ("command", string_field("command")),
    ]
});

/// Tier-two recovery: pull known fields straight out of the raw text.
///
/// Requires at least a recognizable `action` value; everything else is
/// best-effort.
fn recover_fields(raw: &str) -> Option<Value> {
    let mut action_obj = Map::new();
    let mut thought = None;

    for (name, pattern) in FIELD_PATTERNS.iter() {
        let Some(caps) = pattern.captures(raw) else {
            continue;
        };
        let text = caps.get(1)?.as_str();
        let field_value = text
            .parse::<f64>()
            .map(|n| json!(n))
            .unwrap_or_else(|_| json!(text));
        if *name == "thought" {
            thought = Some(field_value);
        } else {
            action_obj.insert((*name).to_string(), field_value);
        }
    }

    // Without an action kind there is nothing to execute.
    action_obj.get("action")?;

    let mut root = Map::new();
    if let Some(t) = thought {
        root.insert("thought".to_string(), t);
    }
    root.insert("action".to_string(), Value::Object(action_obj));
    Some(Value::Object(root))
}

static KIND_SYNONYMS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("tap", "click"),
        ("left_click", "click"),
        ("long_click", "long_press"),
        ("hold", "long_press"),
        ("input", "type"),
        ("write", "type"),
        ("submit", "enter"),
        ("send", "enter"),
        ("confirm", "enter"),
        ("key", "press"),
        ("hotkey", "press"),
        ("keypress", "press"),
        ("swipe", "drag"),
        ("mouse_move", "move"),
        ("hover", "move"),
        ("sleep", "wait"),
        ("pause", "wait"),
        ("cmd", "shell"),
        ("run", "shell"),
        ("execute", "shell"),
        ("bash", "shell"),
        ("terminal", "shell"),
        ("done", "task_complete"),
        ("finish", "task_complete"),
        ("finished", "task_complete"),
        ("complete", "task_complete"),
    ]
});

const CANONICAL_KINDS: &[&str] = &[
    "click",
    "double_click",
    "right_click",
    "long_press",
    "type",
    "enter",
    "press",
    "scroll",
    "drag",
    "move",
    "wait",
    "task_complete",
    "shell",
];

/// Map a reported action kind onto the canonical vocabulary.
///
/// Unrecognized kinds normalize to `wait` rather than failing the whole
/// response.
fn normalize_kind(kind: &str) -> &'static str {
    let lowered = kind.trim().to_lowercase();
    if let Some(canonical) = CANONICAL_KINDS.iter().find(|k| **k == lowered) {
        return canonical;
    }
    if let Some((_, canonical)) = KIND_SYNONYMS.iter().find(|(syn, _)| *syn == lowered) {
        return canonical;
    }
    tracing::warn!(kind = %kind, "unrecognized action kind, normalizing to wait");
    "wait"
}

/// Normalize the action object and validate it into a typed [`Action`].
///
/// `root` is the full response object; some models put the kind at the top
/// level (`{"action": "click", "x": ...}`) instead of nesting it, so field
/// lookups fall back to the root.
fn normalize_and_validate(action_value: Value, root: &Value) -> Result<Action, RecoverError> {
    let mut fields: Map<String, Value> = match action_value {
        Value::Object(map) => map,
        // Bare kind string: fields live on the root object.
        Value::String(kind) => {
            let mut map = root.as_object().cloned().unwrap_or_default();
            map.insert("action".to_string(), json!(kind));
            map
        }
        _ => {
            return Err(RecoverError::MalformedJson(
                "response has no action object".to_string(),
            ))
        }
    };

    let kind_raw = fields
        .get("action")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RecoverError::MalformedJson("action kind is not a string".to_string()))?;
    let kind = normalize_kind(&kind_raw);

    unpack_coordinate_arrays(&mut fields);

    // A shell action that lost its command is a harmless omission, not worth
    // escalating into a hard error.
    if kind == "shell" && trimmed_string(&fields, "command").is_none() {
        tracing::warn!("shell action with empty command downgraded to wait");
        return Ok(Action::Wait {
            duration: EMPTY_SHELL_WAIT_MS,
        });
    }

    build_action(kind, &fields).map_err(RecoverError::ActionFormat)
}

/// Unpack 2-element coordinate arrays into scalar fields.
///
/// Accepts `x: [a, b]`, as well as `coordinate`/`position`/`start` for the
/// origin and `end`/`target` for the drag endpoint.
fn unpack_coordinate_arrays(fields: &mut Map<String, Value>) {
    let pair = |v: &Value| -> Option<(f64, f64)> {
        let arr = v.as_array()?;
        if arr.len() != 2 {
            return None;
        }
        Some((number(&arr[0])?, number(&arr[1])?))
    };

    for key in ["x", "coordinate", "position", "point", "start"] {
        if let Some((x, y)) = fields.get(key).and_then(|v| pair(v)) {
            fields.insert("x".to_string(), json!(x));
            fields.insert("y".to_string(), json!(y));
            break;
        }
    }
    for key in ["end_x", "end", "end_coordinate", "target"] {
        if let Some((x, y)) = fields.get(key).and_then(|v| pair(v)) {
            fields.insert("end_x".to_string(), json!(x));
            fields.insert("end_y".to_string(), json!(y));
            break;
        }
    }
}

/// Numeric coercion: JSON numbers, plus numeric strings the model sometimes
/// emits.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn trimmed_string(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_number(
    fields: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<f64, ActionError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(ActionError::MissingField { kind, field }),
        Some(v) => number(v).ok_or_else(|| ActionError::InvalidField {
            kind,
            field,
            reason: format!("expected a finite number, got {}", v),
        }),
    }
}

fn require_point(
    fields: &Map<String, Value>,
    kind: &'static str,
) -> Result<(f64, f64), ActionError> {
    Ok((
        require_number(fields, kind, "x")?,
        require_number(fields, kind, "y")?,
    ))
}

/// Build the typed action, enforcing the per-kind required fields.
fn build_action(kind: &'static str, fields: &Map<String, Value>) -> Result<Action, ActionError> {
    match kind {
        "click" => {
            let (x, y) = require_point(fields, "click")?;
            Ok(Action::Click { x, y })
        }
        "double_click" => {
            let (x, y) = require_point(fields, "double_click")?;
            Ok(Action::DoubleClick { x, y })
        }
        "right_click" => {
            let (x, y) = require_point(fields, "right_click")?;
            Ok(Action::RightClick { x, y })
        }
        "long_press" => {
            let (x, y) = require_point(fields, "long_press")?;
            Ok(Action::LongPress {
                x,
                y,
                hold_seconds: fields.get("hold_seconds").and_then(number),
            })
        }
        "move" => {
            let (x, y) = require_point(fields, "move")?;
            Ok(Action::Move { x, y })
        }
        "drag" => {
            let (x, y) = require_point(fields, "drag")?;
            let end_x = require_number(fields, "drag", "end_x")?;
            let end_y = require_number(fields, "drag", "end_y")?;
            Ok(Action::Drag {
                x,
                y,
                end_x,
                end_y,
                duration: fields.get("duration").and_then(number),
            })
        }
        "type" => {
            let text = fields
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or(ActionError::MissingField {
                    kind: "type",
                    field: "text",
                })?
                .to_string();
            Ok(Action::Type { text })
        }
        "enter" => Ok(Action::Enter),
        "press" => {
            let keys = extract_keys(fields);
            if keys.is_empty() {
                return Err(ActionError::MissingField {
                    kind: "press",
                    field: "keys",
                });
            }
            Ok(Action::Press { keys })
        }
        "scroll" => {
            let scroll_amount = require_number(fields, "scroll", "scroll_amount")?;
            Ok(Action::Scroll {
                x: fields.get("x").and_then(number),
                y: fields.get("y").and_then(number),
                scroll_amount,
            })
        }
        "wait" => {
            let duration = require_number(fields, "wait", "duration")?;
            Ok(Action::Wait { duration })
        }
        "task_complete" => Ok(Action::TaskComplete),
        "shell" => {
            let command = trimmed_string(fields, "command").ok_or(ActionError::MissingField {
                kind: "shell",
                field: "command",
            })?;
            Ok(Action::Shell {
                command,
                shell: trimmed_string(fields, "shell"),
                timeout: fields.get("timeout").and_then(number),
                work_dir: trimmed_string(fields, "work_dir"),
                capture_output: fields
                    .get("capture_output")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
            })
        }
        other => Err(ActionError::UnknownKind(other.to_string())),
    }
}

/// Accept `keys` as a list, or as a single `+`-joined string.
fn extract_keys(fields: &Map<String, Value>) -> Vec<String> {
    match fields.get("keys") {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split('+')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate_for_log(raw: &str) -> String {
    const LIMIT: usize = 200;
    if raw.chars().count() <= LIMIT {
        raw.to_string()
    } else {
        let head: String = raw.chars().take(LIMIT).collect();
        format!("{}...", head)
    }
}
