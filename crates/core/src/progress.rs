use tokio::sync::mpsc::UnboundedSender;

/// Events emitted while a pack is being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Transfer started; `total` comes from the length header when known.
    Started { total: Option<u64> },
    Received { bytes: u64, total: Option<u64> },
    /// Whole archive received, pack hash being checked.
    CheckingPack,
    Extracting,
    Verifying { model_id: String },
    Installing,
    Finished,
}

/// Optional receiver end of progress events. Dropped receivers are ignored.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}
