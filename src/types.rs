use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single browser action the planner can emit and the executor can run.
/// Closed set: adding a kind means a new variant here, a match arm in the
/// executor, and a line in the planner prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        #[serde(default)]
        text: String,
    },
    Press {
        selector: String,
        #[serde(default = "default_key")]
        key: String,
    },
    Scroll {
        #[serde(default = "default_scroll_amount")]
        amount: i64,
    },
    Wait {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    Screenshot,
}

fn default_key() -> String {
    "Enter".to_string()
}

fn default_scroll_amount() -> i64 {
    800
}

fn default_wait_ms() -> u64 {
    1000
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Press { .. } => "press",
            Action::Scroll { .. } => "scroll",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// One planned browser action with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    #[serde(flatten)]
    pub action: Action,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn pending(index: usize, action: Action) -> Self {
        Self {
            index,
            action,
            status: StepStatus::Pending,
            duration_ms: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Planning,
    Running,
    Completed,
    Failed,
}

/// One goal-to-completion run. Owned by exactly one session; replaced, never
/// merged, when a new task starts.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    pub plan: Vec<Step>,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>, plan: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            plan,
            state: TaskState::Planning,
            created_at: Utc::now(),
        }
    }
}

/// Which secret fields an interactive credential prompt is asking for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFields {
    pub username: bool,
    pub email: bool,
    pub password: bool,
}

impl CredentialFields {
    pub fn from_selector(selector: &str) -> Self {
        let lowered = selector.to_lowercase();
        Self {
            username: lowered.contains("user") || lowered.contains("email"),
            email: lowered.contains("email"),
            password: lowered.contains("password"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceItem {
    pub title: String,
    pub price: Option<f64>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformListing {
    pub platform: String,
    pub items: Vec<PriceItem>,
}
