use tracing::info;
use taskdispatch::{config::Config, utils::init_logger, TaskQueues};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        environment = %config.queue.environment,
        disabled = config.queue.disabled,
        "Configuration loaded"
    );

    let queues = TaskQueues::redis(&config);
    queues.lifecycle.start_all().await?;

    info!("Waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down job queue...");
    queues.lifecycle.stop_all().await?;

    Ok(())
}
