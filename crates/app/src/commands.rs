use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;

use slipcheck_core::{FailureRecord, JobId, MimeType, SlipcheckConfig, VerificationJob};
use slipcheck_ocr::{default_backend, Preprocessor, SlipVerifier};
use slipcheck_queue::{LogNotifier, Notifier, ProcessingQueue, ResultSink};
use slipcheck_storage::{ContentStore, FileStore, SqliteResultStore};

use crate::args::SlipArg;
use crate::intake;

/// Everything a command needs, wired from config.
pub struct Services {
    pub config: SlipcheckConfig,
    pub files: ContentStore,
    pub store: Arc<SqliteResultStore>,
}

impl Services {
    pub async fn open(config: SlipcheckConfig, data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let files = ContentStore::new(data_dir.join("slips"));
        let db_path = data_dir.join("slipcheck.db");
        let store = SqliteResultStore::open(&db_path)
            .await
            .with_context(|| format!("opening {}", db_path.display()))?;
        tracing::debug!(data_dir = %data_dir.display(), "Services ready");

        Ok(Self { config, files, store: Arc::new(store) })
    }

    fn start_queue(&self, notifier: Arc<dyn Notifier>) -> ProcessingQueue {
        let preprocessor = Preprocessor::new(self.config.preprocess.clone());
        let verifier = Arc::new(SlipVerifier::new(
            default_backend(),
            preprocessor,
            self.config.verifier.clone(),
        ));
        ProcessingQueue::start(verifier, self.store.clone(), notifier, &self.config.queue)
    }

    /// Store the bytes, reserve a row, then hand the job to the queue.
    async fn submit(&self, queue: &ProcessingQueue, slip: &SlipArg) -> Result<JobId> {
        let ext = slip
            .path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| anyhow!("{} has no file extension", slip.path.display()))?;
        let mime_type = MimeType::from_extension(ext)?;
        let bytes = tokio::fs::read(&slip.path)
            .await
            .with_context(|| format!("reading {}", slip.path.display()))?;

        let name = slip.path.file_name().and_then(|n| n.to_str()).unwrap_or(ext);
        let stored = self.files.save(&bytes, name).await?;

        let id = JobId::new(uuid::Uuid::new_v4().to_string());
        self.store.reserve_job(&id, Some(stored.key.as_str())).await?;

        let mut job = VerificationJob::new(id.clone(), bytes, mime_type);
        if let Some(expected) = &slip.expect_id {
            job = job.with_expected_transaction_id(expected.as_str());
        }
        if let Some(expected) = &slip.expect_amount {
            job = job.with_expected_amount(expected.as_str());
        }
        if let Err(e) = queue.enqueue(job) {
            // The row is already reserved; it must not stay queued.
            let failure = FailureRecord::new(id.clone(), format!("enqueue failed: {e}"));
            if let Err(store_err) = self.store.record_failure(&id, failure).await {
                tracing::error!(job_id = %id, error = %store_err, "Failed to record enqueue failure");
            }
            return Err(e.into());
        }

        tracing::info!(job_id = %id, path = %slip.path.display(), file = %stored.url, "Slip submitted");
        Ok(id)
    }

    async fn print_job(&self, id: &JobId) -> Result<()> {
        let record = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| anyhow!("no job with id {id}"))?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        Ok(())
    }
}

pub async fn verify(services: &Services, slips: &[SlipArg]) -> Result<()> {
    let queue = services.start_queue(Arc::new(LogNotifier));

    let mut ids = Vec::with_capacity(slips.len());
    for slip in slips {
        match services.submit(&queue, slip).await {
            Ok(id) => ids.push(id),
            Err(e) => tracing::error!(path = %slip.path.display(), error = %e, "Slip rejected"),
        }
    }

    queue.shutdown().await;

    for id in &ids {
        services.print_job(id).await?;
    }
    if ids.len() < slips.len() {
        anyhow::bail!("{} of {} slips were rejected", slips.len() - ids.len(), slips.len());
    }
    Ok(())
}

pub async fn watch(services: &Services, dir: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&dir).await?;
    let queue = services.start_queue(Arc::new(LogNotifier));

    // Bridges the notify watcher thread and the async submitter.
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);
    let _watcher = intake::spawn_intake_watcher(&dir, tx).context("starting intake watcher")?;
    tracing::info!(dir = %dir.display(), "Watching intake folder");

    loop {
        tokio::select! {
            Some(path) = rx.recv() => {
                let slip = SlipArg::bare(path);
                if let Err(e) = services.submit(&queue, &slip).await {
                    tracing::warn!(path = %slip.path.display(), error = %e, "Skipping intake file");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(queued = queue.size(), in_flight = queue.in_flight(), "Interrupted, draining queue");
                break;
            }
        }
    }

    queue.shutdown().await;
    Ok(())
}

pub async fn status(services: &Services, id: &str) -> Result<()> {
    services.print_job(&JobId::new(id)).await
}
