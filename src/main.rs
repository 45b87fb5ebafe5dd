use anyhow::{anyhow, Result};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use market_ingestion::orchestrator::RunState;
use market_ingestion::{server, Config, Engine};

/// One run followed by grading whatever became gradable.
async fn run_cycle(engine: &Engine) -> Result<RunState> {
    let result = engine.run_ingestion(None).await?;
    let snapshots: usize = result.leagues.iter().map(|l| l.counts.snapshots_appended).sum();
    info!(
        run_id = %result.run_id,
        state = result.state.as_str(),
        timed_out = result.timed_out,
        snapshots,
        "Run completed"
    );

    match engine.grading().grade_pending().await {
        Ok(summary) if summary.graded > 0 => info!(graded = summary.graded, "Graded picks"),
        Ok(_) => {}
        Err(e) => warn!("Grading pass failed: {:?}", e),
    }
    Ok(result.state)
}

async fn schedule_loop(engine: Arc<Engine>, interval: Duration) {
    info!("Starting scheduled ingestion (interval: {}s)", interval.as_secs());
    loop {
        if let Err(e) = run_cycle(&engine).await {
            error!("Scheduled run failed: {:?}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("market_ingestion=info".parse()?),
        )
        .init();

    info!("Market Ingestion Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let http_port = config.http_port;
    let run_once = config.run_once;
    let interval = config.schedule_interval_seconds;

    let engine = Arc::new(Engine::connect(config).await?);

    // Check if running in one-shot mode (manual trigger)
    if run_once {
        info!("Running in one-shot mode (RUN_ONCE=true)");
        return match run_cycle(&engine).await? {
            RunState::Failed => Err(anyhow!("One-shot run failed for every league")),
            _ => Ok(()),
        };
    }

    let app = server::router(engine.clone());
    let addr = format!("0.0.0.0:{}", http_port);
    info!("HTTP endpoints listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let scheduled = async {
        if interval > 0 {
            schedule_loop(engine.clone(), Duration::from_secs(interval)).await;
        } else {
            info!("No schedule configured; waiting for POST /ingest/run");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
            }
        }
        _ = scheduled => {}
        _ = ctrl_c => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
