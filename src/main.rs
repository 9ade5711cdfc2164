//! Bridge CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use pai_slack_bridge::config::Config;
use pai_slack_bridge::conversation::ThreadStore;
use pai_slack_bridge::intake::Intake;
use pai_slack_bridge::processor::Processor;
use pai_slack_bridge::queue::Queue;
use pai_slack_bridge::slack::{ChatClient as _, SlackAdapter};

#[derive(Parser)]
#[command(name = "pai-slack-bridge", version)]
#[command(about = "Bridge Slack conversations to a local Claude CLI agent")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Override the queue base directory
    #[arg(long)]
    queue_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let mut config = Config::load().context("failed to load configuration")?;
    config.debug |= cli.debug;
    if let Some(queue_dir) = cli.queue_dir {
        config.queue.base_dir = queue_dir;
    }

    init_tracing(config.debug);

    tracing::info!(
        queue_dir = %config.queue.base_dir.display(),
        cli_path = %config.claude.cli_path.display(),
        "starting pai-slack-bridge"
    );

    let adapter = Arc::new(
        SlackAdapter::new(&config.slack.bot_token, &config.slack.app_token)
            .context("failed to create slack adapter")?,
    );

    let queue = Arc::new(Queue::new(&config.queue.base_dir));
    let store = Arc::new(ThreadStore::new(config.thread_store_dir())?);

    let mut events = adapter.start().await.context("failed to connect to slack")?;
    let bot_user_id = adapter.whoami().await?;

    let processor = Processor::new(
        queue.clone(),
        store.clone(),
        adapter.clone(),
        config.claude.clone(),
        config.queue.poll_interval,
    );
    tokio::spawn(processor.run());

    let intake = Arc::new(Intake::new(
        queue,
        store,
        adapter,
        bot_user_id,
        config.allowed_users.clone(),
        config.allowed_channels.clone(),
    ));

    // Events are handled concurrently; the queue serializes the actual work.
    while let Some(event) = events.next().await {
        let intake = intake.clone();
        tokio::spawn(async move {
            intake.handle_event(event).await;
        });
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}
