use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Local};
use video_ingest::Frame;

/// Alert raised when at least one rule fired during an evaluation.
#[derive(Clone, Debug)]
pub struct RiskEvent {
    pub source_id: String,
    pub source_name: String,
    /// Deduplicated alert messages, in sorted order.
    pub messages: BTreeSet<String>,
    /// Keys of the rules that fired, e.g. `CHILD_NEAR_KNIFE`.
    pub rules: BTreeSet<String>,
    pub frame: Arc<Frame>,
    pub timestamp: DateTime<Local>,
}

impl RiskEvent {
    /// Messages joined into one line.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Subscriber notified synchronously, in registration order, for every
/// [`RiskEvent`]. Errors and panics are logged by the engine and do not reach
/// other observers.
pub trait RiskObserver: Send + Sync {
    fn name(&self) -> &str;

    fn on_alert(&self, event: &RiskEvent) -> anyhow::Result<()>;
}
