use clap::Parser; // for cli
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagner_gateway::backend::{HttpBackend, ImageBackend};
use imagner_gateway::config::{Args, OrchestratorConfig};
use imagner_gateway::connectivity::connectivity_monitor;
use imagner_gateway::handlers;
use imagner_gateway::orchestrator::Orchestrator;
use imagner_gateway::persistence::{HttpImageSink, ImageSink, NullSink};
use imagner_gateway::state::AppState;
use imagner_gateway::state_store::FileStateStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagner_gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // parse cli arguments
    let args = Args::parse();
    let config = OrchestratorConfig::from(&args);

    let client = reqwest::Client::new();
    let backend: Arc<dyn ImageBackend> = Arc::new(
        HttpBackend::new(client.clone(), &args.backend_url).with_probe_path(&args.probe_path),
    );
    let sink: Arc<dyn ImageSink> = match &args.persist_url {
        Some(url) => Arc::new(HttpImageSink::new(client.clone(), url)),
        None => Arc::new(NullSink),
    };

    let orchestrator = Orchestrator::builder(backend.clone())
        .config(config.clone())
        .sink(sink)
        .state_store(Arc::new(FileStateStore::new(&args.state_file)))
        .spawn()
        .await;

    // spawn the connectivity monitor
    tokio::spawn(connectivity_monitor(
        orchestrator.connectivity(),
        backend,
        Duration::from_secs(args.health_interval.max(1)),
    ));

    // log every state transition
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "orchestrator event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event logger lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    //creating the router with routes
    let app = handlers::router(AppState { orchestrator });

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(port = args.port, "Gateway running on http://localhost:{}", args.port);
    tracing::info!(backend = %args.backend_url, "Forwarding generation requests");
    tracing::info!(
        cache_ttl_secs = config.cache_ttl.as_secs(),
        max_attempts = config.max_attempts,
        attempt_timeout = ?config.attempt_timeout,
        state_file = %args.state_file.display(),
        "Orchestrator configured"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
