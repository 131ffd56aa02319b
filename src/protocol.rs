//! Wire protocol between the engine and its observer.
//!
//! Every frame is a JSON object with a SCREAMING_SNAKE `type` tag plus the
//! variant's fields. Delivery preserves emission order within a session;
//! a reconnecting observer sees only what is emitted after it attaches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{CredentialFields, PlatformListing, Step};

/// Commands an observer may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    StartTask {
        #[serde(default)]
        goal: String,
    },
    CredentialsProvided {
        #[serde(default)]
        data: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Events streamed to the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    TaskStarted {
        goal: String,
        steps: Vec<Step>,
    },
    StepStarted {
        index: usize,
        step: Step,
    },
    StepCompleted {
        index: usize,
        step: Step,
        duration_ms: u64,
    },
    StepFailed {
        index: usize,
        step: Step,
        duration_ms: u64,
        error: String,
    },
    TaskCompleted {
        goal: String,
    },
    BrowserFrame {
        image: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    PriceResults {
        query: String,
        max_price: Option<f64>,
        results: Vec<PlatformListing>,
    },
    CredentialsRequired {
        fields: CredentialFields,
    },
}

impl ServerMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}
