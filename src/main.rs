use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use viewgate::api::{build_router, AppState};
use viewgate::config::{Config, QueueBackend};
use viewgate::jobs::{JobStatusStore, PgJobStore};
use viewgate::queue::{ChannelQueue, JobConsumer, JobProducer, JobQueue, PgJobQueue};
use viewgate::reader::{self, PgReader, RowSource};
use viewgate::router::QueryRouter;
use viewgate::storage::{ExportStore, ObjectStoreExport};
use viewgate::worker::{spawn_pool, ExportWorker};
use viewgate::Registry;

/// How often expired job records are reclaimed
const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on waiting for in-flight exports at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let registry = Arc::new(Registry::builtin().context("building view registry")?);
    let mut views: Vec<_> = registry.view_names().collect();
    views.sort_unstable();

    let pool = reader::connect(
        &config.database_url,
        config.db_max_connections,
        config.db_connect_timeout,
    )
    .await
    .context("connecting to database")?;
    let source: Arc<dyn RowSource> = Arc::new(PgReader::new(pool.clone()));

    let job_store = PgJobStore::new(pool.clone());
    job_store.ensure_schema().await.context("creating job table")?;
    let jobs: Arc<dyn JobStatusStore> = Arc::new(job_store);

    let s3 = AmazonS3Builder::from_env()
        .with_bucket_name(&config.export_bucket)
        .build()
        .context("configuring export bucket")?;
    let store: Arc<dyn ExportStore> = Arc::new(ObjectStoreExport::new(Arc::new(s3)));

    let (queue, consumer) = match config.queue_backend {
        QueueBackend::Postgres => {
            let queue = Arc::new(PgJobQueue::new(
                pool,
                config.queue_visibility_timeout,
                config.queue_poll_interval,
            ));
            queue.ensure_schema().await.context("creating queue table")?;
            (queue.clone() as Arc<dyn JobQueue>, queue as Arc<dyn JobConsumer>)
        }
        QueueBackend::Memory => {
            warn!("using the in-process queue; queued exports do not survive a restart");
            let (queue, receiver) = ChannelQueue::bounded(config.queue_capacity);
            (
                Arc::new(queue) as Arc<dyn JobQueue>,
                Arc::new(receiver) as Arc<dyn JobConsumer>,
            )
        }
    };
    let producer = JobProducer::new(queue);
    let worker = Arc::new(ExportWorker::new(
        source.clone(),
        store,
        jobs.clone(),
        config.export_settings(),
    ));
    let (stop_workers, stop_rx) = watch::channel(false);
    let mut workers = spawn_pool(worker, consumer, config.worker_concurrency, stop_rx);

    let janitor = tokio::spawn(purge_expired(jobs.clone()));

    let app = build_router(AppState {
        router: QueryRouter::new(registry, source, producer),
        jobs,
    });
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, ?views, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    janitor.abort();
    info!("draining export workers");
    // idle workers stop now, busy ones after their current job
    let _ = stop_workers.send(true);
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "export worker panicked");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            backend = ?config.queue_backend,
            "export workers still busy at shutdown; only the postgres queue redelivers their jobs"
        );
        workers.abort_all();
    }
    Ok(())
}

async fn purge_expired(jobs: Arc<dyn JobStatusStore>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        match jobs.purge_expired(Utc::now().timestamp()).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "expired job records removed"),
            Err(e) => warn!(error = %e, "failed to purge job records"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
