use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;

use slipcheck_core::{MimeType, Money, VerificationJob, VerificationResult, VerifierSettings};

use crate::extract::AmountExtractor;
use crate::matcher;
use crate::preprocess::Preprocessor;
use crate::recognizer::{OcrBackend, OcrError, Recognition};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
    #[error("OCR task aborted: {0}")]
    Aborted(String),
}

/// Everything the verifier needs from a job.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub bytes: Vec<u8>,
    pub mime_type: MimeType,
    pub expected_transaction_id: Option<String>,
    pub expected_amount: Option<String>,
}

impl From<VerificationJob> for VerifyRequest {
    fn from(job: VerificationJob) -> Self {
        Self {
            bytes: job.raw_bytes,
            mime_type: job.mime_type,
            expected_transaction_id: job.expected_transaction_id,
            expected_amount: job.expected_amount,
        }
    }
}

/// An OCR call that outlived its timeout. The blocking thread cannot be
/// cancelled; callers that budget engine capacity wait on this before
/// reusing the slot.
#[derive(Debug)]
pub struct AbandonedOcr(JoinHandle<Result<Recognition, OcrError>>);

impl AbandonedOcr {
    /// Resolves once the engine call has actually returned.
    pub async fn settle(self) {
        if let Err(e) = self.0.await {
            tracing::warn!(error = %e, "Abandoned OCR task ended abnormally");
        }
    }
}

/// Orchestrates: preprocess → OCR → normalise/match id → extract amount →
/// compare amounts. OCR is the only step that can fail.
pub struct SlipVerifier {
    recognizer: Arc<dyn OcrBackend>,
    preprocessor: Arc<Preprocessor>,
    extractor: AmountExtractor,
    settings: VerifierSettings,
}

impl SlipVerifier {
    pub fn new(
        recognizer: Arc<dyn OcrBackend>,
        preprocessor: Preprocessor,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            recognizer,
            preprocessor: Arc::new(preprocessor),
            extractor: AmountExtractor::new(settings.amount_ceiling),
            settings,
        }
    }

    pub async fn verify(&self, request: VerifyRequest) -> Result<VerificationResult, VerifyError> {
        self.verify_tracked(request).await.0
    }

    /// Like [`verify`](Self::verify), but on timeout also hands back the
    /// still-running engine call.
    pub async fn verify_tracked(
        &self,
        request: VerifyRequest,
    ) -> (Result<VerificationResult, VerifyError>, Option<AbandonedOcr>) {
        let VerifyRequest { bytes, mime_type, expected_transaction_id, expected_amount } = request;

        // 1. Preprocess (never fails; a crashed task means the original bytes).
        let original: Arc<[u8]> = Arc::from(bytes);
        let image_bytes = {
            let pre = Arc::clone(&self.preprocessor);
            let data = Arc::clone(&original);
            match tokio::task::spawn_blocking(move || pre.preprocess(&data, mime_type)).await {
                Ok(processed) => processed,
                Err(e) => {
                    tracing::warn!(error = %e, "Preprocessing task aborted, using original bytes");
                    original.to_vec()
                }
            }
        };

        // 2. OCR under a hard timeout.
        let started = Instant::now();
        let recognizer = Arc::clone(&self.recognizer);
        let timeout = self.settings.ocr_timeout();
        let mut task = tokio::task::spawn_blocking(move || recognizer.recognize(&image_bytes));
        let recognition = match tokio::time::timeout(timeout, &mut task).await {
            Err(_) => return (Err(VerifyError::Timeout(timeout)), Some(AbandonedOcr(task))),
            Ok(Err(join)) => return (Err(VerifyError::Aborted(join.to_string())), None),
            Ok(Ok(Err(e))) => return (Err(e.into()), None),
            Ok(Ok(Ok(recognition))) => recognition,
        };
        tracing::debug!(
            ocr_ms = started.elapsed().as_millis() as u64,
            confidence = recognition.confidence,
            "OCR complete"
        );

        // 3. Collapse whitespace.
        let text = collapse_whitespace(&recognition.text);

        // 4–5. Normalise and match the expected id.
        let id_match = matcher::match_transaction_id(
            expected_transaction_id.as_deref(),
            &text,
            self.settings.match_threshold,
            self.settings.fold_confusables,
        );

        // 6. Amount from the collapsed, non-normalised text.
        let detected_amount = self.extractor.extract(&text).map(Money::from_decimal);

        // 7. Caller's expected amount.
        let expected_amount = expected_amount.as_deref().and_then(Money::parse_loose);

        // 8. Amount comparison.
        let amount_match = match (detected_amount, expected_amount) {
            (Some(detected), Some(expected)) => {
                Some(detected.within(expected, self.settings.amount_tolerance))
            }
            _ => None,
        };

        let result = VerificationResult {
            transaction_match: id_match.matched,
            confidence: recognition.confidence,
            extracted_text: text,
            distance: id_match.distance,
            detected_amount,
            expected_amount,
            amount_match,
            processed_at: Utc::now(),
        };
        (Ok(result), None)
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
