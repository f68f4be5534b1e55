use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use rmq_rpc::app::{shutdown_signal, App};
use rmq_rpc::config::Settings;
use rmq_rpc::translation::{self, MemoryHistory};
use rmq_rpc::{create_lapin_transport, logging, AmqpConfig, RouterBuilder, RouterCell};

#[derive(Parser)]
#[command(name = "rmq-rpc")]
#[command(about = "RPC server over RabbitMQ with health and metrics endpoints", long_about = None)]
struct Cli {
    /// YAML settings file. Falls back to $CONFIG_PATH, then config/config.yml.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    logging::init(&settings.log);

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let history = Arc::new(MemoryHistory::default());
    let routers = RouterCell::new();
    let router = routers.get_or_try_init(|| {
        translation::routes(RouterBuilder::new(), history.clone()).map(RouterBuilder::build)
    })?;

    let transport = create_lapin_transport(&AmqpConfig {
        url: settings.rabbitmq.url.clone(),
        transport_id: settings.app.name.clone(),
        prefetch: settings.rpc.prefetch,
    })
    .await
    .context("failed to connect to broker")?;

    let app = App::start(&settings, transport, router, Some(metrics))
        .await
        .context("failed to start servers")?;

    app.run_until(shutdown_signal())
        .await
        .context("server stopped on fatal error")?;

    tracing::info!("bye");
    Ok(())
}
