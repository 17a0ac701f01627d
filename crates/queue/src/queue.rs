//! Bounded-concurrency FIFO that runs each slip through the verifier exactly
//! once, persists the outcome and then notifies.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use slipcheck_core::{FailureRecord, JobError, JobId, JobStatus, QueueSettings, VerificationJob, VerificationResult};
use slipcheck_ocr::{SlipVerifier, VerifyRequest};

use crate::notify::{Notification, Notifier, Outcome};
use crate::sink::{ResultRow, ResultSink};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Job id is missing")]
    MissingId,
    #[error("Invalid job: {0}")]
    Invalid(JobError),
    #[error("Job {0} is already queued or processing")]
    DuplicateId(JobId),
    #[error("Queue is shut down")]
    Closed,
}

/// Read-only view of the scheduler's bookkeeping plus the set of ids that
/// have not reached a terminal state yet.
struct Gauges {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    outstanding: watch::Sender<usize>,
    active: Mutex<HashSet<JobId>>,
}

impl Gauges {
    fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            outstanding,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: &JobId) {
        self.active().remove(id);
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// The per-job pipeline shared by every worker task.
#[derive(Clone)]
struct Worker {
    verifier: Arc<SlipVerifier>,
    sink: Arc<dyn ResultSink>,
    notifier: Arc<dyn Notifier>,
}

impl Worker {
    async fn run(self, job: VerificationJob) {
        let id = job.id.clone();
        let waited_ms = (Utc::now() - job.enqueued_at).num_milliseconds();
        tracing::info!(job_id = %id, mime_type = %job.mime_type, waited_ms, "Processing slip");

        if let Err(e) = self.sink.mark_processing(&id).await {
            tracing::warn!(job_id = %id, error = %e, "Failed to mark job processing");
        }

        let started = Instant::now();
        let (outcome, abandoned) = self.verifier.verify_tracked(VerifyRequest::from(job)).await;
        let notification = match outcome {
            Ok(result) => self.complete(&id, result).await,
            Err(e) => self.fail(&id, e.to_string()).await,
        };
        tracing::debug!(job_id = %id, elapsed_ms = started.elapsed().as_millis() as u64, "Slip pipeline finished");

        // Persistence has already happened; delivery is best-effort.
        self.deliver(notification).await;

        // The job is already terminal, but its engine call still holds the slot.
        if let Some(abandoned) = abandoned {
            tracing::warn!(job_id = %id, "Waiting for timed-out OCR call before freeing the worker");
            abandoned.settle().await;
        }
    }

    async fn deliver(&self, notification: Notification) {
        let id = notification.id.clone();
        if let Err(e) = self.notifier.notify(notification).await {
            tracing::warn!(job_id = %id, error = %e, "Notification failed");
        }
    }

    async fn complete(&self, id: &JobId, result: VerificationResult) -> Notification {
        let status = JobStatus::from_result(&result);
        let row = match ResultRow::from_result(&result, status) {
            Ok(row) => row,
            Err(e) => return self.fail(id, e.to_string()).await,
        };
        if let Err(e) = self.sink.record_result(id, row).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist result");
        }
        tracing::info!(
            job_id = %id,
            status = %status,
            distance = ?result.distance,
            amount_match = ?result.amount_match,
            confidence = result.confidence,
            "Slip processed"
        );
        Notification { id: id.clone(), status, outcome: Outcome::Result(Box::new(result)) }
    }

    async fn fail(&self, id: &JobId, message: String) -> Notification {
        tracing::error!(job_id = %id, error = %message, "Slip verification failed");
        let record = FailureRecord::new(id.clone(), message.clone());
        if let Err(e) = self.sink.record_failure(id, record).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist failure");
        }
        Notification { id: id.clone(), status: JobStatus::Failed, outcome: Outcome::Error(message) }
    }
}

/// FIFO verification queue with a fixed worker budget.
///
/// The pending list and in-flight count live inside a single scheduler task;
/// this handle only sends jobs to it and reads published gauges. Must be
/// started from within a tokio runtime.
pub struct ProcessingQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<VerificationJob>>>,
    gauges: Arc<Gauges>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingQueue {
    pub fn start(
        verifier: Arc<SlipVerifier>,
        sink: Arc<dyn ResultSink>,
        notifier: Arc<dyn Notifier>,
        settings: &QueueSettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let gauges = Arc::new(Gauges::new());
        let worker = Worker { verifier, sink, notifier };
        let scheduler = tokio::spawn(schedule(rx, worker, Arc::clone(&gauges), concurrency));
        tracing::info!(concurrency, "Processing queue started");

        Self {
            tx: Mutex::new(Some(tx)),
            gauges,
            scheduler: Mutex::new(Some(scheduler)),
        }
    }

    /// Admit a job. Only boundary problems are reported here; pipeline
    /// failures surface through the sink and notifier.
    pub fn enqueue(&self, job: VerificationJob) -> Result<(), EnqueueError> {
        job.validate().map_err(|e| match e {
            JobError::MissingId => EnqueueError::MissingId,
            other => EnqueueError::Invalid(other),
        })?;

        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return Err(EnqueueError::Closed);
        };

        let id = job.id.clone();
        if !self.gauges.active().insert(id.clone()) {
            return Err(EnqueueError::DuplicateId(id));
        }
        self.gauges.queued.fetch_add(1, Ordering::SeqCst);
        self.gauges.outstanding.send_modify(|n| *n += 1);

        if tx.send(job).is_err() {
            self.gauges.queued.fetch_sub(1, Ordering::SeqCst);
            self.gauges.release(&id);
            return Err(EnqueueError::Closed);
        }
        tracing::debug!(job_id = %id, "Slip queued");
        Ok(())
    }

    /// Jobs waiting for a worker.
    pub fn size(&self) -> usize {
        self.gauges.queued.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.gauges.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        *self.gauges.outstanding.borrow() == 0
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.gauges.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop admitting jobs, let everything already admitted finish, then
    /// join the scheduler.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler task ended abnormally");
            }
        }
        tracing::info!("Processing queue stopped");
    }
}

async fn schedule(
    mut rx: mpsc::UnboundedReceiver<VerificationJob>,
    worker: Worker,
    gauges: Arc<Gauges>,
    concurrency: usize,
) {
    let mut fifo: VecDeque<VerificationJob> = VecDeque::new();
    let mut in_flight = 0usize;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobId>();
    let mut accepting = true;

    loop {
        while in_flight < concurrency {
            let Some(job) = fifo.pop_front() else { break };
            in_flight += 1;
            gauges.in_flight.fetch_add(1, Ordering::SeqCst);
            gauges.queued.fetch_sub(1, Ordering::SeqCst);
            spawn_job(job, worker.clone(), done_tx.clone());
        }

        if !accepting && fifo.is_empty() && in_flight == 0 {
            break;
        }

        tokio::select! {
            received = rx.recv(), if accepting => match received {
                Some(job) => fifo.push_back(job),
                None => accepting = false,
            },
            Some(id) = done_rx.recv() => {
                in_flight -= 1;
                gauges.in_flight.fetch_sub(1, Ordering::SeqCst);
                gauges.release(&id);
            }
            else => break,
        }
    }
    tracing::debug!("Scheduler drained");
}

fn spawn_job(job: VerificationJob, worker: Worker, done: mpsc::UnboundedSender<JobId>) {
    let id = job.id.clone();
    tokio::spawn(async move {
        // A panicking job must still reach a terminal state and hand its
        // worker slot back.
        if let Err(e) = tokio::spawn(worker.clone().run(job)).await {
            let notification = worker.fail(&id, format!("job task panicked: {e}")).await;
            worker.deliver(notification).await;
        }
        let _ = done.send(id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelNotifier, NotifyError};
    use crate::sink::{MemorySink, SinkError, StoredOutcome};
    use async_trait::async_trait;
    use slipcheck_core::{MimeType, VerifierSettings};
    use slipcheck_ocr::{OcrBackend, OcrError, Preprocessor, Recognition};
    use std::time::Duration;

    /// Reads its behaviour from the job bytes, e.g. `sleep:40;text:Total 5.00`
    /// or `fail`. Junk bytes pass through the preprocessor untouched.
    #[derive(Default)]
    struct ScriptedRecognizer {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn play(script: &str) -> Result<Recognition, OcrError> {
            let mut text = String::new();
            for step in script.split(';') {
                if let Some(ms) = step.strip_prefix("sleep:") {
                    std::thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
                } else if let Some(t) = step.strip_prefix("text:") {
                    text = t.to_string();
                } else if step == "fail" {
                    return Err(OcrError::Engine("scripted failure".into()));
                }
            }
            Ok(Recognition { text, confidence: 64.0 })
        }
    }

    impl OcrBackend for ScriptedRecognizer {
        fn recognize(&self, image_bytes: &[u8]) -> Result<Recognition, OcrError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let out = Self::play(&String::from_utf8_lossy(image_bytes));
            self.running.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    struct Harness {
        queue: ProcessingQueue,
        sink: Arc<MemorySink>,
        ocr: Arc<ScriptedRecognizer>,
    }

    fn harness_with(
        concurrency: usize,
        settings: VerifierSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Harness {
        let ocr = Arc::new(ScriptedRecognizer::default());
        let verifier = Arc::new(SlipVerifier::new(ocr.clone(), Preprocessor::default(), settings));
        let sink = Arc::new(MemorySink::new());
        let queue = ProcessingQueue::start(
            verifier,
            sink.clone(),
            notifier,
            &QueueSettings { concurrency },
        );
        Harness { queue, sink, ocr }
    }

    fn harness(concurrency: usize) -> (Harness, mpsc::UnboundedReceiver<Notification>) {
        let (notifier, rx) = ChannelNotifier::new();
        (harness_with(concurrency, VerifierSettings::default(), Arc::new(notifier)), rx)
    }

    fn job(id: &str, script: &str) -> VerificationJob {
        VerificationJob::new(id, script.as_bytes().to_vec(), MimeType::Jpeg)
    }

    async fn settle(queue: &ProcessingQueue) {
        tokio::time::timeout(Duration::from_secs(10), queue.wait_idle())
            .await
            .expect("queue did not drain");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn single_worker_completes_in_submission_order() {
        let (h, mut rx) = harness(1);
        let scripts = [("a", "sleep:60"), ("b", "sleep:5"), ("c", "sleep:30"), ("d", ""), ("e", "sleep:10")];
        for (id, script) in scripts {
            h.queue.enqueue(job(id, script)).unwrap();
        }
        settle(&h.queue).await;

        let order: Vec<String> = drain(&mut rx).into_iter().map(|n| n.id.to_string()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(h.ocr.peak.load(Ordering::SeqCst), 1);

        // Every job reached its terminal state before the next one started.
        let history = h.sink.history();
        for pair in history.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, JobStatus::Processing);
            assert!(pair[1].1.is_terminal());
        }
    }

    #[tokio::test]
    async fn failing_job_is_recorded_and_does_not_block_the_next() {
        let (h, mut rx) = harness(1);
        h.queue.enqueue(job("bad", "fail")).unwrap();
        h.queue.enqueue(job("good", "text:Total 5.00")).unwrap();
        settle(&h.queue).await;

        let bad = h.sink.get(&JobId::new("bad")).unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        match bad.outcome {
            StoredOutcome::Failed(record) => {
                assert_eq!(record.transaction_id, JobId::new("bad"));
                assert!(record.error_message.contains("scripted failure"));
            }
            other => panic!("expected failure record, got {other:?}"),
        }
        assert_eq!(h.sink.status(&JobId::new("good")), Some(JobStatus::Pending));

        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].status, JobStatus::Failed);
        assert!(matches!(notes[0].outcome, Outcome::Error(_)));
        assert_eq!(notes[1].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn matching_slip_is_validated() {
        let (h, mut rx) = harness(1);
        let slip = job("slip-42", "text:Payment Ref TXNOO42 Total USD 100.00")
            .with_expected_transaction_id("TXN0042")
            .with_expected_amount("100.00");
        h.queue.enqueue(slip).unwrap();
        settle(&h.queue).await;

        let stored = h.sink.get(&JobId::new("slip-42")).unwrap();
        assert_eq!(stored.status, JobStatus::Validated);
        let StoredOutcome::Completed(row) = stored.outcome else {
            panic!("expected a result row");
        };
        assert_eq!(row.confidence, 64.0);
        let result: VerificationResult = serde_json::from_str(&row.result_json).unwrap();
        assert_eq!(result.transaction_match, Some(true));
        assert_eq!(result.amount_match, Some(true));
        assert_eq!(
            result.detected_amount.map(|m| m.as_decimal()),
            Some(rust_decimal::Decimal::new(10000, 2))
        );

        let note = rx.recv().await.unwrap();
        assert_eq!(note.status, JobStatus::Validated);
        assert!(matches!(note.outcome, Outcome::Result(_)));
    }

    #[tokio::test]
    async fn rejects_blank_and_duplicate_ids() {
        let (h, _rx) = harness(1);
        h.queue.enqueue(job("a", "sleep:100")).unwrap();

        assert!(matches!(
            h.queue.enqueue(job("a", "")),
            Err(EnqueueError::DuplicateId(id)) if id == JobId::new("a")
        ));
        assert!(matches!(
            h.queue.enqueue(job("  ", "")),
            Err(EnqueueError::MissingId)
        ));

        settle(&h.queue).await;
        // Rejected submissions never reached the sink.
        assert_eq!(h.sink.history().len(), 2);
        // Once terminal, the id is free again.
        assert!(h.queue.enqueue(job("a", "")).is_ok());
        settle(&h.queue).await;
    }

    #[tokio::test]
    async fn gauges_follow_the_lifecycle() {
        let (h, _rx) = harness(1);
        assert!(h.queue.is_idle());
        assert_eq!(h.queue.size(), 0);

        for id in ["a", "b", "c"] {
            h.queue.enqueue(job(id, "sleep:200")).unwrap();
        }
        assert!(!h.queue.is_idle());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.queue.in_flight(), 1);
        assert_eq!(h.queue.size(), 2);

        settle(&h.queue).await;
        assert!(h.queue.is_idle());
        assert_eq!(h.queue.size(), 0);
        assert_eq!(h.queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_budget_is_respected() {
        let (h, mut rx) = harness(2);
        for i in 0..6 {
            h.queue.enqueue(job(&format!("j{i}"), "sleep:40")).unwrap();
        }
        settle(&h.queue).await;
        assert_eq!(h.ocr.peak.load(Ordering::SeqCst), 2);
        assert_eq!(drain(&mut rx).len(), 6);
    }

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _n: Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn notifier_errors_do_not_corrupt_bookkeeping() {
        let h = harness_with(1, VerifierSettings::default(), Arc::new(BrokenNotifier));
        h.queue.enqueue(job("a", "text:Total 1.00")).unwrap();
        h.queue.enqueue(job("b", "fail")).unwrap();
        settle(&h.queue).await;

        assert_eq!(h.sink.status(&JobId::new("a")), Some(JobStatus::Pending));
        assert_eq!(h.sink.status(&JobId::new("b")), Some(JobStatus::Failed));
        assert!(h.queue.is_idle());
        assert_eq!(h.queue.in_flight(), 0);
    }

    /// Records what the sink held at the moment each notification arrived.
    struct PeekingNotifier {
        sink: Arc<MemorySink>,
        seen: Mutex<Vec<(JobStatus, Option<JobStatus>)>>,
    }

    #[async_trait]
    impl Notifier for PeekingNotifier {
        async fn notify(&self, n: Notification) -> Result<(), NotifyError> {
            let stored = self.sink.status(&n.id);
            self.seen.lock().unwrap().push((n.status, stored));
            Ok(())
        }
    }

    #[tokio::test]
    async fn persistence_happens_before_notification() {
        let ocr = Arc::new(ScriptedRecognizer::default());
        let verifier = Arc::new(SlipVerifier::new(ocr, Preprocessor::default(), VerifierSettings::default()));
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(PeekingNotifier { sink: sink.clone(), seen: Mutex::new(Vec::new()) });
        let queue = ProcessingQueue::start(verifier, sink, notifier.clone(), &QueueSettings::default());

        queue.enqueue(job("ok", "text:nothing useful")).unwrap();
        queue.enqueue(job("ko", "fail")).unwrap();
        settle(&queue).await;

        let seen = notifier.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (JobStatus::Pending, Some(JobStatus::Pending)),
                (JobStatus::Failed, Some(JobStatus::Failed)),
            ]
        );
    }

    #[tokio::test]
    async fn ocr_timeout_fails_the_job_only() {
        let settings = VerifierSettings { ocr_timeout_ms: 30, ..VerifierSettings::default() };
        let (notifier, mut rx) = ChannelNotifier::new();
        let h = harness_with(1, settings, Arc::new(notifier));
        h.queue.enqueue(job("slow", "sleep:400")).unwrap();
        h.queue.enqueue(job("fast", "text:Total 9.99")).unwrap();
        settle(&h.queue).await;

        let notes = drain(&mut rx);
        assert_eq!(notes[0].id, JobId::new("slow"));
        assert_eq!(notes[0].status, JobStatus::Failed);
        assert!(matches!(&notes[0].outcome, Outcome::Error(e) if e.contains("timed out")));
        assert_eq!(h.sink.status(&JobId::new("fast")), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn timed_out_ocr_keeps_its_worker_slot() {
        let settings = VerifierSettings { ocr_timeout_ms: 30, ..VerifierSettings::default() };
        let (notifier, mut rx) = ChannelNotifier::new();
        let h = harness_with(1, settings, Arc::new(notifier));
        for i in 0..4 {
            h.queue.enqueue(job(&format!("hung-{i}"), "sleep:150")).unwrap();
        }

        // The first job has timed out and been notified, but its engine call
        // is still running, so the queue is not idle and nothing else started.
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(!h.queue.is_idle());
        assert_eq!(h.queue.in_flight(), 1);

        settle(&h.queue).await;
        assert_eq!(h.ocr.peak.load(Ordering::SeqCst), 1);
        assert_eq!(h.ocr.running.load(Ordering::SeqCst), 0);
        for i in 0..4 {
            assert_eq!(h.sink.status(&JobId::new(format!("hung-{i}"))), Some(JobStatus::Failed));
        }
    }

    /// Blows up the moment a job starts, after which it behaves like `MemorySink`.
    #[derive(Default)]
    struct ExplodingSink(MemorySink);

    #[async_trait]
    impl ResultSink for ExplodingSink {
        async fn mark_processing(&self, _id: &JobId) -> Result<(), SinkError> {
            panic!("sink bug")
        }
        async fn record_result(&self, id: &JobId, row: ResultRow) -> Result<(), SinkError> {
            self.0.record_result(id, row).await
        }
        async fn record_failure(&self, id: &JobId, failure: FailureRecord) -> Result<(), SinkError> {
            self.0.record_failure(id, failure).await
        }
    }

    #[tokio::test]
    async fn panicking_job_is_failed_and_notified() {
        let ocr = Arc::new(ScriptedRecognizer::default());
        let verifier = Arc::new(SlipVerifier::new(ocr, Preprocessor::default(), VerifierSettings::default()));
        let sink = Arc::new(ExplodingSink::default());
        let (notifier, mut rx) = ChannelNotifier::new();
        let queue = ProcessingQueue::start(verifier, sink.clone(), Arc::new(notifier), &QueueSettings::default());

        queue.enqueue(job("boom", "")).unwrap();
        queue.enqueue(job("after", "")).unwrap();
        settle(&queue).await;

        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].id, JobId::new("boom"));
        assert_eq!(notes[0].status, JobStatus::Failed);
        assert!(matches!(&notes[0].outcome, Outcome::Error(e) if e.contains("panicked")));
        assert_eq!(sink.0.status(&JobId::new("boom")), Some(JobStatus::Failed));
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn shutdown_drains_then_refuses_new_work() {
        let (h, mut rx) = harness(1);
        h.queue.enqueue(job("a", "sleep:20")).unwrap();
        h.queue.enqueue(job("b", "")).unwrap();
        h.queue.shutdown().await;

        assert_eq!(drain(&mut rx).len(), 2);
        assert!(h.queue.is_idle());
        assert!(matches!(h.queue.enqueue(job("c", "")), Err(EnqueueError::Closed)));
    }
}
