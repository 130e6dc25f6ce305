mod face;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::broadcast;
use tracing::{info, warn};

use webpilot::brain::OpenAiClient;
use webpilot::config::{ModelSettings, Policy};
use webpilot::hands::{BrowserConfig, ChromeSession};
use webpilot::logging;
use webpilot::operator::OperatorConsole;
use webpilot::{AgentEvent, Orchestrator};

/// Browser agent that proposes each step and lets an operator override it.
#[derive(Parser, Debug)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Port of the operator control server.
    #[arg(long, env = "WEBPILOT_PORT", default_value_t = 3000)]
    port: u16,

    #[arg(long, env = "WEBPILOT_MODEL")]
    model: Option<String>,

    /// OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "WEBPILOT_MAX_STEPS")]
    max_steps: Option<usize>,

    /// Override window polling tick, in milliseconds.
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Override window length, in ticks.
    #[arg(long)]
    window_ticks: Option<u32>,

    /// Where session logs are written.
    #[arg(long, env = "WEBPILOT_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    headless: bool,

    /// DevTools endpoint of a running Chrome.
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    attach: String,

    /// Always launch a fresh Chrome instead of attaching.
    #[arg(long)]
    launch: bool,

    /// Report elements outside the viewport too.
    #[arg(long)]
    full_page: bool,

    #[arg(long, default_value = "agent_profile")]
    profile_dir: PathBuf,

    /// Run this task right away instead of waiting for one.
    task: Option<String>,
}

impl Cli {
    fn policy(&self) -> Result<Policy> {
        let mut policy = Policy {
            viewport_only: !self.full_page,
            ..Policy::default()
        };
        if let Some(max_steps) = self.max_steps {
            policy.max_steps = max_steps;
        }
        if let Some(tick_ms) = self.tick_ms {
            policy.tick_ms = tick_ms;
        }
        if let Some(window_ticks) = self.window_ticks {
            policy.window_ticks = window_ticks;
        }
        policy.validate().context("invalid policy")?;
        Ok(policy)
    }

    fn model_settings(&self) -> Result<ModelSettings> {
        let mut settings = ModelSettings::from_env()?;
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        Ok(settings)
    }

    fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            attach_url: (!self.launch).then(|| self.attach.clone()),
            headless: self.headless,
            chrome_path: None,
            profile_dir: self.profile_dir.clone(),
        }
    }

    fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join("webpilot").join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init("info");

    let settings = cli.model_settings()?;
    let policy = cli.policy()?;
    let log_dir = cli.log_dir();
    info!(target: "agent", model = %settings.model, max_steps = policy.max_steps, "starting agent");

    // Control server first, so the operator can connect while Chrome starts.
    let console = Arc::new(OperatorConsole::new());
    let (event_tx, _) = broadcast::channel::<AgentEvent>(256);
    let mut task_rx = face::start_server(cli.port, console.clone(), event_tx.clone()).await?;

    let browser_config = cli.browser_config();
    let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&browser_config))
        .await
        .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))??;

    let remote = Arc::new(session.channel());
    let service = Arc::new(OpenAiClient::new(settings));
    let mut orchestrator =
        Orchestrator::new(policy, remote, service, console.clone(), console.clone())
            .with_events(event_tx)
            .with_log_dir(&log_dir);
    info!(target: "agent", log_dir = %log_dir.display(), "ready for tasks");

    if let Some(task) = &cli.task {
        console.reset();
        let status = orchestrator.run(task).await;
        info!(target: "agent", ?status, "task from command line done");
    }

    while let Some(instructions) = task_rx.recv().await {
        console.reset();
        let status = orchestrator.run(&instructions).await;
        if let Some(failure) = orchestrator.task().failure() {
            warn!(target: "agent", ?status, %failure, "task ended with an error");
        } else {
            info!(target: "agent", ?status, "task done");
        }
    }

    drop(session);
    Ok(())
}
