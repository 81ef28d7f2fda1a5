//! Action vocabulary shared by the recoverer, orchestrator, and control loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default side length of the normalized coordinate square the model reasons in.
///
/// Coordinates in an [`Action`] are always in this 0..N space, never physical
/// pixels; mapping to the real display is the coordinate mapper's job.
pub const DEFAULT_COORDINATE_SCALE: u32 = 1000;

/// Action validation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Action '{kind}' is missing required field '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Action '{kind}' has invalid field '{field}': {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error("Unknown action kind: {0}")]
    UnknownKind(String),
}

/// One executable action returned by the model.
///
/// Coordinates are in the normalized square (see [`DEFAULT_COORDINATE_SCALE`]).
/// Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: f64,
        y: f64,
    },
    DoubleClick {
        x: f64,
        y: f64,
    },
    RightClick {
        x: f64,
        y: f64,
    },
    LongPress {
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        hold_seconds: Option<f64>,
    },
    Type {
        text: String,
    },
    Enter,
    Press {
        keys: Vec<String>,
    },
    Scroll {
        #[serde(skip_serializing_if = "Option::is_none")]
        x: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        y: Option<f64>,
        scroll_amount: f64,
    },
    Drag {
        x: f64,
        y: f64,
        end_x: f64,
        end_y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Move {
        x: f64,
        y: f64,
    },
    Wait {
        duration: f64,
    },
    TaskComplete,
    Shell {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        work_dir: Option<String>,
        #[serde(default = "default_capture_output")]
        capture_output: bool,
    },
}

fn default_capture_output() -> bool {
    true
}

impl Action {
    /// Canonical kind name of this action.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::RightClick { .. } => "right_click",
            Action::LongPress { .. } => "long_press",
            Action::Type { .. } => "type",
            Action::Enter => "enter",
            Action::Press { .. } => "press",
            Action::Scroll { .. } => "scroll",
            Action::Drag { .. } => "drag",
            Action::Move { .. } => "move",
            Action::Wait { .. } => "wait",
            Action::TaskComplete => "task_complete",
            Action::Shell { .. } => "shell",
        }
    }

    /// Compact fingerprint of kind plus discriminating fields.
    ///
    /// Used by the control loop to detect the model repeating the same
    /// action. Coordinates are rounded so float noise does not defeat the
    /// comparison.
    pub fn signature(&self) -> String {
        match self {
            Action::Click { x, y } => format!("click:{},{}", x.round(), y.round()),
            Action::DoubleClick { x, y } => format!("double_click:{},{}", x.round(), y.round()),
            Action::RightClick { x, y } => format!("right_click:{},{}", x.round(), y.round()),
            Action::LongPress { x, y, .. } => format!("long_press:{},{}", x.round(), y.round()),
            Action::Type { text } => format!("type:{}", text),
            Action::Enter => "enter".to_string(),
            Action::Press { keys } => format!("press:{}", keys.join("+")),
            Action::Scroll { scroll_amount, .. } => format!("scroll:{}", scroll_amount),
            Action::Drag {
                x, y, end_x, end_y, ..
            } => format!(
                "drag:{},{}->{},{}",
                x.round(),
                y.round(),
                end_x.round(),
                end_y.round()
            ),
            Action::Move { x, y } => format!("move:{},{}", x.round(), y.round()),
            Action::Wait { duration } => format!("wait:{}", duration),
            Action::TaskComplete => "task_complete".to_string(),
            Action::Shell { command, .. } => format!("shell:{}", command),
        }
    }
}

/// Parsed and validated model response: advisory reasoning plus one action.
///
/// `thought` is log-only and never drives control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub thought: String,
    pub action: Action,
}
