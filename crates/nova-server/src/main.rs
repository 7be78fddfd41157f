use anyhow::Context;
use clap::Parser;
use nova_config::ConfigLoader;
use nova_metrics::{Monitor, NotificationManager};
use nova_server::{api, AppState};
use nova_shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/nova.toml")]
    config: PathBuf,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ConfigLoader::new(&args.config).load()?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    nova_logging::init_logging(&config.logging)?;
    info!(
        config = %args.config.display(),
        rules = config.rules.len(),
        notifiers = config.notifiers.len(),
        "Starting nova-server"
    );

    let rules = config.compile_rules()?;
    let monitor = Arc::new(Monitor::with_system_clock(config.monitor_config(), rules)?);
    let notifications = NotificationManager::from_config(&config.notifiers)?;

    let mut coordinator = ShutdownCoordinator::builder()
        .with_drain_timeout(config.server.drain_timeout)
        .build();

    // 评估循环
    let evaluator = monitor.evaluator().clone();
    let listener = coordinator.subscribe();
    coordinator.track(
        "evaluator",
        tokio::spawn(async move { evaluator.run(listener).await }),
    );

    // 序列淘汰、历史清理、孤儿告警
    let maintenance = monitor.clone();
    let listener = coordinator.subscribe();
    coordinator.track(
        "maintenance",
        tokio::spawn(async move { maintenance.run_maintenance_loop(listener).await }),
    );

    // 告警通知
    let events = monitor.subscribe();
    let listener = coordinator.subscribe();
    coordinator.track(
        "notifications",
        tokio::spawn(async move { notifications.run(events, listener).await }),
    );

    // HTTP
    let addr = config.server.socket_addr()?;
    let state = Arc::new(AppState::new(monitor.clone())?);
    let app = api::create_router(state);
    let mut listener = coordinator.subscribe();
    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            listener.wait().await;
        });
    info!("HTTP server listening on http://{}", addr);
    coordinator.track(
        "http",
        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        }),
    );

    let phase = coordinator.run().await;
    info!(?phase, "nova-server stopped");
    Ok(())
}
