use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskpilot::browser::{BrowserRegistry, ChromeProvider};
use taskpilot::channel::{self, AppState};
use taskpilot::config::Settings;
use taskpilot::planner::{GroqBackend, Planner};

#[derive(Parser)]
#[command(name = "taskpilot", about = "Goal-driven browser automation server")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env());
    if settings.groq_api_key.is_empty() {
        tracing::warn!("GROQ_API_KEY is not set; task planning will fail");
    }

    let planner = Arc::new(Planner::new(
        Arc::new(GroqBackend::new(&settings)),
        settings.max_steps,
    ));
    let registry = Arc::new(BrowserRegistry::new(Arc::new(ChromeProvider::new(
        settings.clone(),
    ))));

    let app = channel::router(AppState {
        settings,
        planner,
        registry,
    });
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.bind, args.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "taskpilot listening");
    axum::serve(listener, app).await?;
    Ok(())
}
