use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::browser::{BrowserCapability, BrowserRegistry};
use crate::config::Settings;
use crate::executor::{CredentialGate, RunOutcome, StepExecutor};
use crate::planner::Planner;
use crate::price;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::{Task, TaskState};

/// Per-connection owner of at most one task at a time. Created on connect,
/// destroyed on disconnect; nothing survives it.
pub struct TaskSession {
    id: Uuid,
    settings: Arc<Settings>,
    planner: Arc<Planner>,
    registry: Arc<BrowserRegistry>,
    events: mpsc::Sender<ServerMessage>,
    state: Mutex<TaskState>,
    gate: Arc<CredentialGate>,
    run: Mutex<Option<JoinHandle<()>>>,
    frames: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSession {
    pub fn new(
        settings: Arc<Settings>,
        planner: Arc<Planner>,
        registry: Arc<BrowserRegistry>,
        events: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            planner,
            registry,
            events,
            state: Mutex::new(TaskState::Idle),
            gate: Arc::new(CredentialGate::new()),
            run: Mutex::new(None),
            frames: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("session state poisoned")
    }

    pub async fn handle(self: &Arc<Self>, message: ClientMessage) {
        match message {
            ClientMessage::StartTask { goal } => self.start(goal).await,
            ClientMessage::CredentialsProvided { data } => {
                if !self.gate.provide(data) {
                    tracing::debug!(session = %self.id, "no credential request outstanding");
                }
            }
        }
    }

    async fn start(self: &Arc<Self>, goal: String) {
        if goal.trim().is_empty() {
            self.emit(ServerMessage::warn("Ignoring empty goal")).await;
            return;
        }

        let accepted = {
            let mut state = self.state.lock().expect("session state poisoned");
            match *state {
                TaskState::Planning | TaskState::Running => false,
                _ => {
                    *state = TaskState::Planning;
                    true
                }
            }
        };
        if !accepted {
            self.emit(ServerMessage::error("A task is already running")).await;
            return;
        }

        let session = self.clone();
        let handle = tokio::spawn(async move { session.run(goal).await });
        *self.run.lock().expect("run handle poisoned") = Some(handle);
    }

    async fn run(self: Arc<Self>, goal: String) {
        if price::is_price_compare(&goal) {
            self.emit(ServerMessage::info("Price comparison mode: parallel platforms"))
                .await;
            self.emit(ServerMessage::TaskStarted {
                goal: goal.clone(),
                steps: vec![],
            })
            .await;
            self.set_state(TaskState::Running);
            if let Err(e) = price::run(&goal, &self.registry, &self.events).await {
                self.emit(ServerMessage::error(format!("Execution error: {e}")))
                    .await;
            }
            self.emit(ServerMessage::TaskCompleted { goal }).await;
            self.set_state(TaskState::Completed);
            return;
        }

        self.emit(ServerMessage::info("Planning steps")).await;
        let plan = match self.planner.generate(&goal).await {
            Ok(plan) => plan,
            Err(e) => {
                self.emit(ServerMessage::error(format!("Planning failed: {e}")))
                    .await;
                self.set_state(TaskState::Idle);
                return;
            }
        };

        let mut task = Task::new(goal, plan);
        tracing::info!(session = %self.id, task = %task.id, steps = task.plan.len(), "plan ready");

        self.emit(ServerMessage::info("Starting browser")).await;
        let browser = match self.registry.acquire(self.id).await {
            Ok(browser) => browser,
            Err(e) => {
                self.emit(ServerMessage::error(format!("Browser unavailable: {e}")))
                    .await;
                self.set_state(TaskState::Failed);
                return;
            }
        };

        self.emit(ServerMessage::TaskStarted {
            goal: task.goal.clone(),
            steps: task.plan.clone(),
        })
        .await;
        task.state = TaskState::Running;
        self.set_state(TaskState::Running);

        let frames = tokio::spawn(frame_loop(
            browser.clone(),
            self.events.clone(),
            self.settings.frame_interval,
        ));
        *self.frames.lock().expect("frame handle poisoned") = Some(frames);

        let executor =
            StepExecutor::new(browser, self.events.clone(), self.gate.clone(), &self.settings);
        let outcome = executor.execute(&mut task.plan).await;

        if let Some(frames) = self.frames.lock().expect("frame handle poisoned").take() {
            frames.abort();
        }
        self.registry.release(&self.id);

        task.state = match outcome {
            RunOutcome::Completed => TaskState::Completed,
            RunOutcome::Failed => TaskState::Failed,
        };
        self.set_state(task.state);
        if task.state == TaskState::Completed {
            self.emit(ServerMessage::TaskCompleted {
                goal: task.goal.clone(),
            })
            .await;
        }
        tracing::info!(session = %self.id, task = %task.id, state = ?task.state, "task finished");
    }

    /// Disconnect teardown: unwind the run mid-step, stop the frame feed,
    /// give the browser back, drop any outstanding credential request.
    pub fn shutdown(&self) {
        if let Some(run) = self.run.lock().expect("run handle poisoned").take() {
            run.abort();
        }
        if let Some(frames) = self.frames.lock().expect("frame handle poisoned").take() {
            frames.abort();
        }
        self.gate.clear();
        self.registry.release(&self.id);
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().expect("session state poisoned") = state;
    }

    async fn emit(&self, message: ServerMessage) {
        let _ = self.events.send(message).await;
    }
}

/// Best-effort live view: snapshot the page on a fixed cadence until the
/// run ends or the observer goes away. Each frame replaces the last.
async fn frame_loop(
    browser: Arc<dyn BrowserCapability>,
    events: mpsc::Sender<ServerMessage>,
    interval: Duration,
) {
    loop {
        if let Ok(image) = browser.screenshot().await {
            let source = browser.current_url().await;
            if events
                .send(ServerMessage::BrowserFrame { image, source })
                .await
                .is_err()
            {
                break;
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{ScriptedBrowser, ScriptedProvider, UnavailableProvider};
    use crate::error::PlanningError;
    use crate::planner::PlanBackend;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CannedPlan(Result<String, String>);

    #[async_trait]
    impl PlanBackend for CannedPlan {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, PlanningError> {
            self.0.clone().map_err(PlanningError::Backend)
        }
    }

    struct Fixture {
        session: Arc<TaskSession>,
        browser: Arc<ScriptedBrowser>,
        rx: mpsc::Receiver<ServerMessage>,
    }

    fn fixture(plan_reply: Result<&str, &str>) -> Fixture {
        let settings = Arc::new(Settings {
            // Keep the frame cadence out of the way of event assertions.
            frame_interval: Duration::from_secs(60),
            ..Settings::default()
        });
        let planner = Arc::new(Planner::new(
            Arc::new(CannedPlan(
                plan_reply.map(String::from).map_err(String::from),
            )),
            settings.max_steps,
        ));
        let browser = Arc::new(ScriptedBrowser::default());
        let registry = Arc::new(BrowserRegistry::new(Arc::new(ScriptedProvider(
            browser.clone(),
        ))));
        let (tx, rx) = mpsc::channel(256);
        let session = Arc::new(TaskSession::new(settings, planner, registry, tx));
        Fixture {
            session,
            browser,
            rx,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Collect events until the predicate matches, skipping frames and logs.
    async fn collect_until(
        rx: &mut mpsc::Receiver<ServerMessage>,
        stop: impl Fn(&ServerMessage) -> bool,
    ) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = stop(&event);
            if !matches!(
                event,
                ServerMessage::BrowserFrame { .. } | ServerMessage::Log { .. }
            ) {
                seen.push(event);
            }
            if done {
                return seen;
            }
        }
    }

    async fn wait_for_state(session: &TaskSession, expected: TaskState) {
        for _ in 0..500 {
            if session.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("session never reached {expected:?}");
    }

    #[tokio::test]
    async fn single_step_goal_runs_to_completion() {
        let mut f = fixture(Ok(r#"[{"action":"navigate","url":"https://example.com"}]"#));
        f.session
            .handle(ClientMessage::StartTask {
                goal: "open example.com".into(),
            })
            .await;

        let events = collect_until(&mut f.rx, |e| {
            matches!(e, ServerMessage::TaskCompleted { .. })
        })
        .await;

        assert!(matches!(
            &events[0],
            ServerMessage::TaskStarted { steps, .. } if steps.len() == 1
        ));
        assert!(matches!(&events[1], ServerMessage::StepStarted { index: 0, .. }));
        assert!(matches!(
            &events[2],
            ServerMessage::StepCompleted { index: 0, .. }
        ));
        assert!(matches!(&events[3], ServerMessage::TaskCompleted { .. }));
        wait_for_state(&f.session, TaskState::Completed).await;
    }

    #[tokio::test]
    async fn failed_step_ends_the_run_without_completion() {
        let mut f = fixture(Ok(
            r##"[
                {"action":"navigate","url":"https://example.com"},
                {"action":"click","selector":"#missing"},
                {"action":"scroll"}
            ]"##,
        ));
        f.session
            .handle(ClientMessage::StartTask {
                goal: "click something".into(),
            })
            .await;

        let events = collect_until(&mut f.rx, |e| {
            matches!(e, ServerMessage::StepFailed { .. })
        })
        .await;

        assert!(matches!(
            events.last(),
            Some(ServerMessage::StepFailed { index: 1, .. })
        ));
        wait_for_state(&f.session, TaskState::Failed).await;
        // Step 2 never started.
        assert!(f.browser.recorded().iter().all(|c| !c.starts_with("scroll")));
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let mut f = fixture(Ok(r#"[{"action":"wait","ms":200}]"#));
        f.session
            .handle(ClientMessage::StartTask {
                goal: "wait around".into(),
            })
            .await;

        // Let the first run get past planning.
        collect_until(&mut f.rx, |e| {
            matches!(e, ServerMessage::StepStarted { .. })
        })
        .await;

        f.session
            .handle(ClientMessage::StartTask {
                goal: "second task".into(),
            })
            .await;

        loop {
            if next_event(&mut f.rx).await == ServerMessage::error("A task is already running") {
                break;
            }
        }
        wait_for_state(&f.session, TaskState::Completed).await;
    }

    #[tokio::test]
    async fn planning_failure_leaves_the_session_idle() {
        let mut f = fixture(Err("model overloaded"));
        f.session
            .handle(ClientMessage::StartTask {
                goal: "anything".into(),
            })
            .await;

        loop {
            if let ServerMessage::Log { message, .. } = next_event(&mut f.rx).await
                && message.contains("Planning failed")
            {
                break;
            }
        }
        wait_for_state(&f.session, TaskState::Idle).await;
        assert!(f.browser.recorded().is_empty());
    }

    #[tokio::test]
    async fn browser_launch_failure_fails_the_task() {
        let settings = Arc::new(Settings::default());
        let planner = Arc::new(Planner::new(
            Arc::new(CannedPlan(Ok(
                r#"[{"action":"navigate","url":"https://example.com"}]"#.into(),
            ))),
            settings.max_steps,
        ));
        let registry = Arc::new(BrowserRegistry::new(Arc::new(UnavailableProvider)));
        let (tx, mut rx) = mpsc::channel(256);
        let session = Arc::new(TaskSession::new(settings, planner, registry, tx));

        session
            .handle(ClientMessage::StartTask {
                goal: "open example.com".into(),
            })
            .await;

        loop {
            if let ServerMessage::Log { message, .. } = next_event(&mut rx).await
                && message.contains("Browser unavailable")
            {
                break;
            }
        }
        wait_for_state(&session, TaskState::Failed).await;
    }

    #[tokio::test]
    async fn credentials_resume_a_suspended_step() {
        let mut f = fixture(Ok(
            r#"[{"action":"type","selector":"input[name='password']","text":""}]"#,
        ));
        f.session
            .handle(ClientMessage::StartTask {
                goal: "log in somewhere".into(),
            })
            .await;

        collect_until(&mut f.rx, |e| {
            matches!(e, ServerMessage::CredentialsRequired { .. })
        })
        .await;

        f.session
            .handle(ClientMessage::CredentialsProvided {
                data: HashMap::from([("password".to_string(), "s3cret".to_string())]),
            })
            .await;

        collect_until(&mut f.rx, |e| {
            matches!(e, ServerMessage::TaskCompleted { .. })
        })
        .await;
        assert!(
            f.browser
                .recorded()
                .contains(&"type input[name='password']=s3cret".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_sessions_receive_only_their_own_events() {
        let mut a = fixture(Ok(r#"[{"action":"navigate","url":"https://a.example"}]"#));
        let mut b = fixture(Ok(r#"[{"action":"navigate","url":"https://b.example"}]"#));

        a.session
            .handle(ClientMessage::StartTask {
                goal: "task for a".into(),
            })
            .await;
        b.session
            .handle(ClientMessage::StartTask {
                goal: "task for b".into(),
            })
            .await;

        let events_a = collect_until(&mut a.rx, |e| {
            matches!(e, ServerMessage::TaskCompleted { .. })
        })
        .await;
        let events_b = collect_until(&mut b.rx, |e| {
            matches!(e, ServerMessage::TaskCompleted { .. })
        })
        .await;

        for event in &events_a {
            if let ServerMessage::TaskStarted { goal, .. } | ServerMessage::TaskCompleted { goal } =
                event
            {
                assert_eq!(goal, "task for a");
            }
        }
        for event in &events_b {
            if let ServerMessage::TaskStarted { goal, .. } | ServerMessage::TaskCompleted { goal } =
                event
            {
                assert_eq!(goal, "task for b");
            }
        }
    }

    #[tokio::test]
    async fn credentials_outside_a_request_are_ignored() {
        let f = fixture(Ok(r#"[{"action":"scroll"}]"#));
        f.session
            .handle(ClientMessage::CredentialsProvided {
                data: HashMap::from([("password".to_string(), "late".to_string())]),
            })
            .await;
        assert_eq!(f.session.state(), TaskState::Idle);
        assert!(f.browser.recorded().is_empty());
    }

    #[tokio::test]
    async fn empty_goal_is_ignored() {
        let mut f = fixture(Ok(r#"[{"action":"scroll"}]"#));
        f.session
            .handle(ClientMessage::StartTask { goal: "  ".into() })
            .await;
        let event = next_event(&mut f.rx).await;
        assert_eq!(event, ServerMessage::warn("Ignoring empty goal"));
        assert_eq!(f.session.state(), TaskState::Idle);
    }
}
