// ==============================================================================
// main.rs - Variant Storage Worker Process
// ==============================================================================
// Description: Background worker that executes variant storage jobs from the
//              Redis queue and periodically checks for pending operations
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod job_processor;
mod queue;

use job_processor::{JobProcessor, JobReport};
use queue::{JobPayload, JobQueue};
use variant_storage::janitor::JanitorPolicy;
use variant_storage::StorageConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Variant Storage Worker v1.0.0");

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let redis_client = RedisClient::open(redis_url).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;
    info!("Connected to Redis");

    let config = match std::env::var("VARIANT_STORAGE_CONFIG") {
        Ok(path) => StorageConfig::from_file(&path)
            .with_context(|| format!("Failed to read config {}", path))?,
        Err(_) => StorageConfig::for_dir(PathBuf::from(
            std::env::var("VARIANT_STORAGE_DIR").unwrap_or_else(|_| "/data/variant-storage".to_string()),
        )),
    };
    let processor = Arc::new(JobProcessor::new(config));
    // Creates the storage layout before the first job
    processor.open_storage().context("Storage directory not accessible")?;

    let janitor_interval = std::env::var("JANITOR_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600);
    let policy = JanitorPolicy {
        max_attempts: std::env::var("MAX_RESUME_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3),
    };

    let invalidate_concurrent = std::env::var("JANITOR_INVALIDATE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if invalidate_concurrent {
        warn!("JANITOR_INVALIDATE set: files of illegal concurrent loads will be invalidated");
    }

    let worker = Worker::new(redis_conn, processor, policy, invalidate_concurrent);

    info!("Checking for pending operations from previous worker instance...");
    if let Err(e) = worker.check_storage(false).await {
        error!("Pending operation check failed: {}", e);
    }

    let janitor = worker.clone();
    tokio::spawn(async move {
        janitor.janitor_loop(Duration::from_secs(janitor_interval)).await;
    });

    info!("Worker ready, waiting for jobs...");
    worker.run().await
}

/// JSON logs when `LOG_FORMAT=json`, compact otherwise
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("variant_worker=info,variant_storage=info"));
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[derive(Clone)]
struct Worker {
    redis_conn: ConnectionManager,
    processor: Arc<JobProcessor>,
    policy: JanitorPolicy,
    /// Let the periodic check invalidate files of concurrent loads
    invalidate_concurrent: bool,
}

impl Worker {
    fn new(
        redis_conn: ConnectionManager,
        processor: Arc<JobProcessor>,
        policy: JanitorPolicy,
        invalidate_concurrent: bool,
    ) -> Self {
        Self {
            redis_conn,
            processor,
            policy,
            invalidate_concurrent,
        }
    }

    /// Main processing loop - polls Redis queue for jobs
    async fn run(&self) -> Result<()> {
        let mut job_queue = JobQueue::new(self.redis_conn.clone());

        loop {
            match job_queue.dequeue().await {
                Ok(Some(payload)) => {
                    info!("Received job: {} ({})", payload.job_id, payload.operation.name());

                    let worker = self.clone();
                    tokio::spawn(async move {
                        let job_id = payload.job_id;
                        if let Err(e) = worker.process_job(payload).await {
                            error!("Job {} processing failed: {}", job_id, e);
                        }
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    error!("Failed to dequeue job: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn process_job(&self, payload: JobPayload) -> Result<()> {
        let job_id = payload.job_id;
        let (tx, mut rx) = mpsc::unbounded_channel::<(f32, String)>();

        // Progress from the blocking job is forwarded to pub/sub
        let forwarder = {
            let worker = self.clone();
            tokio::spawn(async move {
                while let Some((pct, message)) = rx.recv().await {
                    if let Err(e) = worker.publish_progress(job_id, pct, &message).await {
                        warn!("Failed to publish progress for job {}: {}", job_id, e);
                    }
                }
            })
        };

        let processor = self.processor.clone();
        let job = payload.clone();
        let result = tokio::task::spawn_blocking(move || {
            processor.execute(&job, &mut |pct: f32, message: &str| {
                let _ = tx.send((pct, message.to_string()));
            })
        })
        .await
        .context("Job task panicked")?;
        let _ = forwarder.await;

        let report = match result {
            Ok(report) => {
                if report.is_success() {
                    info!("Job {} completed: {}", job_id, report.message);
                } else {
                    warn!("Job {} finished with {} failures", job_id, report.failed.len());
                }
                report
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                self.publish_progress(job_id, 0.0, &format!("Failed: {}", e)).await?;
                JobReport {
                    job_id,
                    operation: payload.operation.name().to_string(),
                    study: payload.study.clone(),
                    message: e.to_string(),
                    failed: [(payload.operation.name().to_string(), e.to_string())].into_iter().collect(),
                    ..JobReport::default()
                }
            }
        };

        let mut job_queue = JobQueue::new(self.redis_conn.clone());
        job_queue
            .store_result(job_id, &serde_json::to_string(&report)?)
            .await?;
        Ok(())
    }

    /// Publish progress update via Redis pub/sub
    async fn publish_progress(&self, job_id: Uuid, progress: f32, message: &str) -> Result<()> {
        let mut job_queue = JobQueue::new(self.redis_conn.clone());

        let progress_msg = serde_json::json!({
            "job_id": job_id,
            "progress_pct": progress,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        job_queue.publish_progress(job_id, &progress_msg.to_string()).await?;
        Ok(())
    }

    /// Log pending operations of every study; with `invalidate`, also mark
    /// files of illegal concurrent loads INVALID
    async fn check_storage(&self, invalidate: bool) -> Result<()> {
        let processor = self.processor.clone();
        let policy = self.policy;
        let check = tokio::task::spawn_blocking(move || processor.check_storage(policy, invalidate))
            .await
            .context("Storage check task panicked")??;
        info!(
            "Storage check: {} pending operations, {} concurrent loads, {} files invalidated",
            check.pending, check.concurrent_loads, check.invalidated
        );
        Ok(())
    }

    async fn janitor_loop(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            info!("Running pending operation check");
            if let Err(e) = self.check_storage(self.invalidate_concurrent).await {
                error!("Pending operation check failed: {}", e);
            }
        }
    }
}
