pub mod notify;
pub mod queue;
pub mod sink;

pub use notify::{ChannelNotifier, LogNotifier, Notification, Notifier, NotifyError, Outcome};
pub use queue::{EnqueueError, ProcessingQueue};
pub use sink::{MemorySink, ResultRow, ResultSink, SinkError, StoredJob, StoredOutcome};
