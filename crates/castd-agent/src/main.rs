use castd_agent::{Supervisor, config::Settings, http, reaper::Reaper, stats::StatsSampler};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing(settings: &Settings) -> Option<WorkerGuard> {
    let stdout = fmt::layer();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(stdout);

    match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "castd-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal(supervisor: Supervisor) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    // Unblocks pending manifest waits so the server can drain.
    supervisor.shutdown_token().cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    let _log_guard = init_tracing(&settings);

    let addr = settings.listen_addr;
    let supervisor = Supervisor::new(settings);

    Reaper::new(supervisor.clone()).spawn();
    StatsSampler::new(supervisor.clone()).spawn();

    let app = http::router(supervisor.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "castd-agent HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor.clone()))
        .await?;

    supervisor.shutdown().await;
    tracing::info!("castd-agent stopped");
    Ok(())
}
