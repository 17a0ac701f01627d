pub mod extract;
pub mod matcher;
pub mod preprocess;
pub mod recognizer;
pub mod verifier;

pub use extract::{extract_amount, AmountExtractor};
pub use matcher::{best_window_distance, distance, match_transaction_id, normalize, IdMatch};
pub use preprocess::{PageRasterizer, PdfiumRasterizer, PreprocessError, Preprocessor};
pub use recognizer::{default_backend, MockRecognizer, OcrBackend, OcrError, Recognition, UnavailableRecognizer};
pub use verifier::{AbandonedOcr, SlipVerifier, VerifyError, VerifyRequest};
