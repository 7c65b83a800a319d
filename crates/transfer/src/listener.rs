use tokio::sync::mpsc;

use ferry_protocol::{LocalArtifact, TransferEvent, TransferFailure};

/// Receives the outcome and progress of one transfer.
///
/// Exactly one of `on_success` or `on_error` is called per run; a paused run
/// calls neither. Methods are called from the transfer's worker task and
/// must not block.
pub trait ProgressListener: Send + Sync {
    /// The transfer finished. Downloads pass the written artifact.
    fn on_success(&self, artifact: Option<LocalArtifact>);

    fn on_error(&self, failure: TransferFailure);

    /// `complete` of `total` bytes are confirmed.
    fn on_progress(&self, complete: u64, total: u64);
}

/// Forwards events of one transfer into a channel, tagged with its source.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    source: String,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelListener {
    pub fn new(source: impl Into<String>, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            source: source.into(),
            tx,
        }
    }

    fn send(&self, event: TransferEvent) {
        // The receiver going away just means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl ProgressListener for ChannelListener {
    fn on_success(&self, artifact: Option<LocalArtifact>) {
        self.send(TransferEvent::Completed {
            source: self.source.clone(),
            artifact,
        });
    }

    fn on_error(&self, failure: TransferFailure) {
        self.send(TransferEvent::Failed(failure));
    }

    fn on_progress(&self, complete: u64, total: u64) {
        self.send(TransferEvent::Progress {
            source: self.source.clone(),
            complete,
            total,
        });
    }
}
