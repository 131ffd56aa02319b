use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::Settings;
use crate::error::PlanningError;
use crate::types::{Action, Step};

const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

const SYSTEM_PROMPT: &str = r#"You are a browser automation planner.

Return ONLY a JSON array of steps.
No markdown. No explanation.

Rules:
- Use actions: navigate, click, type, press, scroll, wait, screenshot
- Extract search keywords from instructions
- Never paste the full instruction into search fields
- URLs must be valid

Example:

Goal:
Find full stack course on geeksforgeeks

Output:
[
 {"action":"navigate","url":"https://www.geeksforgeeks.org"},
 {"action":"type","selector":"input[type='search']","text":"full stack"},
 {"action":"press","selector":"input[type='search']","key":"Enter"}
]
"#;

/// External text-generation capability behind the planner.
#[async_trait]
pub trait PlanBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, PlanningError>;
}

/// Chat-completions backend against the Groq API.
pub struct GroqBackend {
    client: Client,
    api_key: String,
    model: String,
}

impl GroqBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::new(),
            api_key: settings.groq_api_key.clone(),
            model: settings.groq_model.clone(),
        }
    }
}

#[async_trait]
impl PlanBackend for GroqBackend {
    async fn complete(&self, system: &str, user: &str) -> Result<String, PlanningError> {
        let response = self
            .client
            .post(GROQ_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| PlanningError::Backend(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlanningError::Backend(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(PlanningError::Backend(format!("{status}: {message}")));
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PlanningError::InvalidResponse("no content in completion".into()))
    }
}

/// Turns a goal into a validated, Pending plan.
pub struct Planner {
    backend: Arc<dyn PlanBackend>,
    max_steps: usize,
}

impl Planner {
    pub fn new(backend: Arc<dyn PlanBackend>, max_steps: usize) -> Self {
        Self { backend, max_steps }
    }

    /// Validation is all-or-nothing: one bad entry rejects the whole plan.
    pub async fn generate(&self, goal: &str) -> Result<Vec<Step>, PlanningError> {
        let text = self
            .backend
            .complete(SYSTEM_PROMPT, &format!("Goal: {goal}"))
            .await?;

        let raw = extract_array(&text)?;
        let entries: Vec<serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| PlanningError::InvalidResponse(e.to_string()))?;

        if entries.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut actions = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let action: Action = serde_json::from_value(entry)
                .map_err(|e| PlanningError::InvalidStep {
                    index,
                    reason: e.to_string(),
                })?;
            validate(&action).map_err(|reason| PlanningError::InvalidStep { index, reason })?;
            actions.push(action);
        }

        actions.truncate(self.max_steps);
        Ok(actions
            .into_iter()
            .enumerate()
            .map(|(index, action)| Step::pending(index, action))
            .collect())
    }
}

fn validate(action: &Action) -> Result<(), String> {
    match action {
        Action::Navigate { url } if url.trim().is_empty() => Err("empty url".into()),
        Action::Click { selector }
        | Action::Type { selector, .. }
        | Action::Press { selector, .. }
            if selector.trim().is_empty() =>
        {
            Err("empty selector".into())
        }
        _ => Ok(()),
    }
}

/// Carve the JSON array out of a completion that may be fenced or wrapped
/// in prose.
fn extract_array(text: &str) -> Result<&str, PlanningError> {
    let cleaned = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let start = cleaned.find('[');
    let end = cleaned.rfind(']');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&cleaned[start..=end]),
        _ => Err(PlanningError::InvalidResponse(
            "no JSON array in completion".into(),
        )),
    }
}
