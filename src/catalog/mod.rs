//! Catalog of classes, streams, observers and subscriptions, plus the event
//! store that detection pipelines write into.
//!
//! A single catalog instance is shared by every pipeline task, so
//! implementations must be safe for concurrent use. Each operation is one
//! logical unit: `persist_event` writes the event and all of its detections
//! atomically.

mod memory;
mod sqlite;

use anyhow::Result;

use crate::fusion::DetectedObject;

pub use memory::InMemoryCatalog;
pub use sqlite::SqliteCatalog;

/// One frame's fused object list, ready to persist.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    pub stream_address: String,
    pub class_id: i64,
    /// Capture time, epoch seconds.
    pub captured_at: i64,
    pub objects: Vec<DetectedObject>,
}

impl DetectionEvent {
    pub fn count(&self) -> usize {
        self.objects.len()
    }
}

/// An observer subscribed to alerts for one stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribedObserver {
    pub email: String,
    pub subscription_id: i64,
    /// Raw interval spec, e.g. "15m", "2h", "1d".
    pub alert_interval: String,
}

/// Display metadata for a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub link: String,
}

pub trait Catalog: Send + Sync {
    /// Class id for a class name, `None` when the catalog has no such class.
    fn class_id_for(&self, label: &str) -> Result<Option<i64>>;

    /// Persist an event and its detections. Returns the assigned event id.
    fn persist_event(&self, event: &DetectionEvent) -> Result<i64>;

    /// Observers with alerting enabled on the stream at `stream_address`.
    fn subscribed_observers(&self, stream_address: &str) -> Result<Vec<SubscribedObserver>>;

    /// Most recent alert recorded for a subscription, epoch seconds.
    fn last_alert_time(&self, subscription_id: i64) -> Result<Option<i64>>;

    fn record_alert(&self, subscription_id: i64, event_id: i64, at: i64) -> Result<()>;

    /// Addresses of every configured stream, empty addresses excluded.
    fn configured_stream_addresses(&self) -> Result<Vec<String>>;

    fn stream_info(&self, stream_address: &str) -> Result<Option<StreamInfo>>;
}

/// Confidence as stored in the event store: truncated integer percent.
pub(crate) fn confidence_percent(confidence: f32) -> i64 {
    (confidence * 100.0) as i64
}
