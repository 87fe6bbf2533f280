//! Operator alerting.

use parking_lot::Mutex;
use rfix_types::{Fragment, PartitionId};
use tracing::error;

/// Fire-and-forget channel to an operator.
pub trait Alerter: Send + Sync {
    fn warn(&self, message: &str);
}

/// Alerter that logs under the `rfix::alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn warn(&self, message: &str) {
        error!(target: "rfix::alert", alert = message, "operator_alert");
    }
}

/// Alerter that keeps every message, for embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlerter {
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

impl Alerter for RecordingAlerter {
    fn warn(&self, message: &str) {
        self.messages.lock().push(message.to_owned());
    }
}

pub(crate) fn unfixable_message(partition: PartitionId, fragment: &Fragment) -> String {
    format!(
        "CAN NOT FIX BROKEN EXTENT!\n\
         Found issue data fragment cause server fault and can not fix it.\n\
         Partition: {partition}\n\
         Extent: {}\n\
         Offset: {}\n\
         Size: {}",
        fragment.extent_id, fragment.offset, fragment.size
    )
}

pub(crate) fn worker_panic_message(partition: PartitionId, message: &str) -> String {
    format!(
        "ISSUE PROCESSOR WORKER PANIC!\n\
         Fix worker occurred panic and stopped:\n\
         Partition: {partition}\n\
         Message  : {message}\n"
    )
}
