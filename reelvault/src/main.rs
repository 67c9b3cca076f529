use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use reelvault::config::IngestConfig;
use reelvault::database::{init_pool, run_migrations, SqlxVideoRepository, VideoRepository};
use reelvault::pipeline::{Dispatcher, FfmpegTranscoder, FfprobeProber, UserResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = IngestConfig::from_env().context("loading configuration")?;
    for dir in [
        config.incoming_dir(),
        config.videos_dir(),
        config.rejected_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating directory '{}'", dir.display()))?;
    }

    let pool = init_pool(&config.database_url())
        .await
        .context("opening database")?;
    run_migrations(&pool).await.context("running migrations")?;
    let repo: Arc<dyn VideoRepository> = Arc::new(SqlxVideoRepository::new(pool));

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<UserResult>();
    let token = CancellationToken::new();

    let dispatcher = Dispatcher::new(
        config,
        repo,
        Arc::new(FfprobeProber::new()),
        Arc::new(FfmpegTranscoder::new()),
        results_tx,
        token.clone(),
    );
    let pipeline = tokio::spawn(dispatcher.run());

    // Result sink: one JSON line per result on stdout, for whatever
    // notification layer sits in front of this process. Ends on its own once
    // the pipeline has dropped all result senders.
    let sink = tokio::spawn(async move {
        while let Some(result) = results_rx.recv().await {
            match serde_json::to_string(&result) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!(error = %e, "unserializable result"),
            }
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");
    token.cancel();

    pipeline.await.context("joining pipeline")??;
    sink.await.ok();
    Ok(())
}
