use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::browser::BrowserCapability;
use crate::config::{FailurePolicy, Settings};
use crate::error::BrowserError;
use crate::protocol::ServerMessage;
use crate::safety;
use crate::types::{Action, CredentialFields, Step, StepStatus};

/// Hand-off point for interactive credential input. The executor parks on
/// it mid-step; the session feeds it when the observer answers. At most
/// one request is outstanding per run.
#[derive(Default)]
pub struct CredentialGate {
    slot: Mutex<Option<oneshot::Sender<HashMap<String, String>>>>,
}

impl CredentialGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) -> oneshot::Receiver<HashMap<String, String>> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().expect("credential gate poisoned") = Some(tx);
        rx
    }

    /// Deliver credentials to a waiting executor. Returns false (a no-op)
    /// when nothing is waiting.
    pub fn provide(&self, data: HashMap<String, String>) -> bool {
        let sender = self.slot.lock().expect("credential gate poisoned").take();
        match sender {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.slot.lock().expect("credential gate poisoned").is_some()
    }

    pub fn clear(&self) {
        self.slot.lock().expect("credential gate poisoned").take();
    }
}

pub enum RunOutcome {
    Completed,
    Failed,
}

struct StepFailure {
    message: String,
    /// Fatal failures abort the run regardless of the failure policy.
    fatal: bool,
}

impl From<BrowserError> for StepFailure {
    fn from(error: BrowserError) -> Self {
        Self {
            message: error.to_string(),
            fatal: false,
        }
    }
}

/// Drives a plan through the browser one step at a time, emitting the
/// lifecycle event stream as it goes.
pub struct StepExecutor {
    browser: Arc<dyn BrowserCapability>,
    events: mpsc::Sender<ServerMessage>,
    gate: Arc<CredentialGate>,
    policy: FailurePolicy,
    credentials_timeout: Option<Duration>,
    login_wait: Duration,
}

impl StepExecutor {
    pub fn new(
        browser: Arc<dyn BrowserCapability>,
        events: mpsc::Sender<ServerMessage>,
        gate: Arc<CredentialGate>,
        settings: &Settings,
    ) -> Self {
        Self {
            browser,
            events,
            gate,
            policy: settings.failure_policy,
            credentials_timeout: settings.credentials_timeout,
            login_wait: settings.login_wait,
        }
    }

    /// Steps run strictly by increasing index; a failure either aborts the
    /// rest of the plan or is recorded and skipped, per policy.
    pub async fn execute(&self, plan: &mut [Step]) -> RunOutcome {
        for index in 0..plan.len() {
            plan[index].status = StepStatus::Active;
            self.emit(ServerMessage::StepStarted {
                index,
                step: plan[index].clone(),
            })
            .await;
            self.emit(ServerMessage::info(format!(
                "Executing step {}: {}",
                index + 1,
                plan[index].action.name()
            )))
            .await;

            let started = Instant::now();
            match self.run_step(&plan[index].action).await {
                Ok(()) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    plan[index].status = StepStatus::Completed;
                    plan[index].duration_ms = Some(duration_ms);
                    self.emit(ServerMessage::StepCompleted {
                        index,
                        step: plan[index].clone(),
                        duration_ms,
                    })
                    .await;
                    self.emit(ServerMessage::info(format!("Completed step {}", index + 1)))
                        .await;
                }
                Err(failure) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    plan[index].status = StepStatus::Failed;
                    plan[index].duration_ms = Some(duration_ms);
                    plan[index].error = Some(failure.message.clone());
                    self.emit(ServerMessage::StepFailed {
                        index,
                        step: plan[index].clone(),
                        duration_ms,
                        error: failure.message.clone(),
                    })
                    .await;
                    self.emit(ServerMessage::error(format!(
                        "Step failed: {}",
                        failure.message
                    )))
                    .await;
                    tracing::warn!(index, error = %failure.message, "step failed");

                    if failure.fatal || self.policy == FailurePolicy::Abort {
                        return RunOutcome::Failed;
                    }
                }
            }
        }
        RunOutcome::Completed
    }

    async fn run_step(&self, action: &Action) -> Result<(), StepFailure> {
        if let Some(reason) = safety::blocked_reason(action) {
            return Err(StepFailure {
                message: reason,
                fatal: true,
            });
        }

        match action {
            Action::Navigate { url } => self.browser.navigate(url).await?,
            Action::Click { selector } => self.browser.click(selector).await?,
            Action::Type { selector, text } => {
                let text = if text.trim().is_empty() && wants_credentials(selector) {
                    self.request_credentials(selector).await?
                } else {
                    text.clone()
                };
                self.browser.type_text(selector, &text).await?;
            }
            Action::Press { selector, key } => self.browser.press(selector, key).await?,
            Action::Scroll { amount } => self.browser.scroll(*amount).await?,
            Action::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Action::Screenshot => {
                let image = self.browser.screenshot().await?;
                let source = self.browser.current_url().await;
                self.emit(ServerMessage::BrowserFrame { image, source }).await;
            }
        }

        if self.browser.is_login_page().await {
            self.emit(ServerMessage::info(format!(
                "Login page detected. Waiting {}ms for manual login.",
                self.login_wait.as_millis()
            )))
            .await;
            tokio::time::sleep(self.login_wait).await;
        }

        Ok(())
    }

    /// Suspend on the gate until the observer supplies the secret the step
    /// is missing. Unbounded unless a timeout was configured.
    async fn request_credentials(&self, selector: &str) -> Result<String, StepFailure> {
        let fields = CredentialFields::from_selector(selector);
        let rx = self.gate.begin();
        self.emit(ServerMessage::CredentialsRequired { fields }).await;

        let received = match self.credentials_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.gate.clear();
                    return Err(StepFailure {
                        message: "credential input timed out".into(),
                        fatal: false,
                    });
                }
            },
            None => rx.await,
        };

        let data = received.map_err(|_| StepFailure {
            message: "credential channel closed before input arrived".into(),
            fatal: false,
        })?;

        let lowered = selector.to_lowercase();
        let value = if lowered.contains("password") {
            data.get("password")
        } else if lowered.contains("email") {
            data.get("email")
        } else {
            data.get("username")
        };
        Ok(value.cloned().unwrap_or_default())
    }

    async fn emit(&self, message: ServerMessage) {
        // Fire and forget: a vanished observer must not stall the run.
        let _ = self.events.send(message).await;
    }
}

fn wants_credentials(selector: &str) -> bool {
    let lowered = selector.to_lowercase();
    lowered.contains("password") || lowered.contains("username") || lowered.contains("email")
}
