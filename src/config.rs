use std::path::PathBuf;
use std::time::Duration;

/// What to do with the rest of the plan after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run at the first failed step.
    #[default]
    Abort,
    /// Record the failure and keep executing later steps.
    Continue,
}

impl FailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "abort" => Some(Self::Abort),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

/// Runtime settings, read once at startup from the environment
/// (a `.env` file is honored via dotenvy before this runs).
#[derive(Debug, Clone)]
pub struct Settings {
    pub groq_api_key: String,
    pub groq_model: String,
    pub headless: bool,
    pub browser_timeout: Duration,
    pub max_steps: usize,
    pub frame_interval: Duration,
    pub user_data_dir: PathBuf,
    pub login_wait: Duration,
    /// None keeps the credentials wait unbounded.
    pub credentials_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            groq_api_key: String::new(),
            groq_model: "llama-3.1-8b-instant".to_string(),
            headless: false,
            browser_timeout: Duration::from_millis(30_000),
            max_steps: 20,
            frame_interval: Duration::from_millis(500),
            user_data_dir: PathBuf::from("user-data"),
            login_wait: Duration::from_millis(60_000),
            credentials_timeout: None,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            groq_api_key: var("GROQ_API_KEY").unwrap_or(defaults.groq_api_key),
            groq_model: var("GROQ_MODEL").unwrap_or(defaults.groq_model),
            headless: var("BROWSER_HEADLESS")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.headless),
            browser_timeout: millis_var("BROWSER_TIMEOUT").unwrap_or(defaults.browser_timeout),
            max_steps: var("MAX_STEPS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_steps),
            frame_interval: millis_var("WS_FRAME_INTERVAL_MS").unwrap_or(defaults.frame_interval),
            user_data_dir: var("USER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.user_data_dir),
            login_wait: millis_var("LOGIN_WAIT_MS").unwrap_or(defaults.login_wait),
            credentials_timeout: millis_var("CREDENTIALS_TIMEOUT_MS"),
            failure_policy: var("FAILURE_POLICY")
                .and_then(|v| FailurePolicy::parse(&v))
                .unwrap_or(defaults.failure_policy),
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn millis_var(key: &str) -> Option<Duration> {
    var(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
