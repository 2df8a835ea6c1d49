use tracing::info;

/// Structured pipeline event kinds pushed to the notification boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Success,
    Failed,
    TapeUnknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Success => "success",
            EventKind::Failed => "failed",
            EventKind::TapeUnknown => "tape-unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub task_name: String,
    pub kind: EventKind,
    pub details: String,
}

impl NotifyEvent {
    pub fn new(task_name: &str, kind: EventKind, details: impl Into<String>) -> Self {
        Self {
            task_name: task_name.to_string(),
            kind,
            details: details.into(),
        }
    }
}

/// Notification boundary. Dispatch is fire-and-forget: implementations must
/// not block the pipeline, and delivery failures are their own problem.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// Default implementation that surfaces events in the structured log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: NotifyEvent) {
        info!(
            task = %event.task_name,
            kind = event.kind.as_str(),
            "{}",
            event.details
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::Started.as_str(), "started");
        assert_eq!(EventKind::Success.as_str(), "success");
        assert_eq!(EventKind::Failed.as_str(), "failed");
        assert_eq!(EventKind::TapeUnknown.as_str(), "tape-unknown");
    }

    #[test]
    fn test_event_construction() {
        let event = NotifyEvent::new("nightly", EventKind::Failed, "boom");
        assert_eq!(event.task_name, "nightly");
        assert_eq!(event.kind, EventKind::Failed);
        assert_eq!(event.details, "boom");
    }
}
