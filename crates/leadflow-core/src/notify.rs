//! Fire-and-forget hooks run after a lead changes hands.
//!
//! Delivery channels (mail, chat, SMS) live in the embedding application and
//! plug in through `Notifier`. A failing notifier is logged and skipped; it
//! never undoes an assignment and never stops the remaining notifiers.

use thiserror::Error;
use tracing::{info, warn};

use crate::lead::{AssignmentRecord, Lead};

#[derive(Debug, Error)]
#[error("{channel}: {message}")]
pub struct NotifyError {
    pub channel: String,
    pub message: String,
}

impl NotifyError {
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    /// Short channel name used in log lines.
    fn name(&self) -> &str;

    fn notify(&self, lead: &Lead, record: &AssignmentRecord) -> Result<(), NotifyError>;
}

/// Writes one structured log line per assignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    fn notify(&self, lead: &Lead, record: &AssignmentRecord) -> Result<(), NotifyError> {
        info!(
            lead = %lead.id,
            consultant = %record.consultant_id,
            kind = %record.kind,
            "lead assigned"
        );
        Ok(())
    }
}

/// Ordered fan-out over every configured notifier.
#[derive(Default)]
pub struct Notifiers {
    sinks: Vec<Box<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: impl Notifier + 'static) -> Self {
        self.push(notifier);
        self
    }

    pub fn push(&mut self, notifier: impl Notifier + 'static) {
        self.sinks.push(Box::new(notifier));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Run every notifier; returns how many failed.
    pub fn dispatch(&self, lead: &Lead, record: &AssignmentRecord) -> usize {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(lead, record) {
                warn!(notifier = sink.name(), lead = %lead.id, error = %e, "notification failed");
                failed += 1;
            }
        }
        failed
    }
}

impl std::fmt::Debug for Notifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Notifiers").field("sinks", &names).finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts calls and optionally fails each one.
    #[derive(Clone, Default)]
    pub struct Recorder {
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl Recorder {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn notify(&self, _lead: &Lead, _record: &AssignmentRecord) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(NotifyError::new("recorder", "mailbox full"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;
    use crate::types::{AssignmentKind, ConsultantId};
    use chrono::Utc;

    fn sample() -> (Lead, AssignmentRecord) {
        let lead = Lead::new("Han", "han@example.com");
        let record =
            AssignmentRecord::new(lead.id, ConsultantId(35), AssignmentKind::Dispatched, Utc::now());
        (lead, record)
    }

    #[test]
    fn failure_does_not_stop_later_notifiers() {
        let bad = Recorder::failing();
        let good = Recorder::default();
        let notifiers = Notifiers::new()
            .with(bad.clone())
            .with(LogNotifier)
            .with(good.clone());
        let (lead, record) = sample();

        assert_eq!(notifiers.dispatch(&lead, &record), 1);
        assert_eq!(bad.count(), 1);
        assert_eq!(good.count(), 1);
    }

    #[test]
    fn empty_fanout_is_a_no_op() {
        let (lead, record) = sample();
        let notifiers = Notifiers::new();
        assert!(notifiers.is_empty());
        assert_eq!(notifiers.dispatch(&lead, &record), 0);
    }

    #[test]
    fn debug_lists_channel_names() {
        let notifiers = Notifiers::new().with(LogNotifier);
        assert_eq!(notifiers.len(), 1);
        assert!(format!("{notifiers:?}").contains("log"));
    }
}
