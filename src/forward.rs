//! Capped sample forwarding.
//!
//! Policy for pushing feature samples to the cloud: at most a fixed
//! number of samples are forwarded per enabled feature; further samples
//! are silently dropped until the forwarder is reset (i.e. notifications
//! are disabled and re-enabled).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::cloud::mqtt::CloudSink;
use crate::error::Result;
use crate::feature::Sample;

/// Number of samples to forward before dropping further notifications.
pub const NOTIFICATION_LIMIT: u32 = 10;

/// Forwards feature samples to a cloud sink, up to a fixed cap.
///
/// The counter is atomic: samples may be delivered from concurrent tasks
/// and the cap must hold regardless.
pub struct SampleForwarder {
    /// Destination for forwarded samples.
    sink: Arc<dyn CloudSink>,
    /// Maximum number of samples to forward.
    limit: u32,
    /// Number of samples forwarded so far.
    forwarded: AtomicU32,
}

impl SampleForwarder {
    /// Create a forwarder with the default cap of [`NOTIFICATION_LIMIT`].
    pub fn new(sink: Arc<dyn CloudSink>) -> Self {
        Self::with_limit(sink, NOTIFICATION_LIMIT)
    }

    /// Create a forwarder with a custom cap.
    pub fn with_limit(sink: Arc<dyn CloudSink>, limit: u32) -> Self {
        Self {
            sink,
            limit,
            forwarded: AtomicU32::new(0),
        }
    }

    /// Handle one incoming sample.
    ///
    /// Forwards the sample to the sink if the cap has not been reached
    /// and returns `true`; otherwise drops it and returns `false`. The
    /// slot is reserved with a compare-exchange before the publish, so
    /// the cap holds even under concurrent delivery.
    pub async fn handle(&self, feature_name: &str, sample: &Sample) -> Result<bool> {
        let reserved = self
            .forwarded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.limit {
                    Some(n + 1)
                } else {
                    None
                }
            });

        if reserved.is_err() {
            debug!("Dropping {} sample, cap reached", feature_name);
            return Ok(false);
        }

        self.sink.send_event(feature_name, sample).await?;
        Ok(true)
    }

    /// Number of samples forwarded so far.
    pub fn forwarded(&self) -> u32 {
        self.forwarded.load(Ordering::SeqCst)
    }

    /// Check whether the cap has been reached.
    pub fn is_complete(&self) -> bool {
        self.forwarded() >= self.limit
    }

    /// The configured cap.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Rearm the cap, e.g. after notifications were disabled and
    /// re-enabled.
    pub fn reset(&self) {
        self.forwarded.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mqtt::MockCloudSink;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sample() -> Sample {
        Sample {
            timestamp: Some(1),
            values: vec![23.4],
            raw: vec![0xEA, 0x00],
            notification_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_forwards_up_to_cap_then_drops() {
        let mut sink = MockCloudSink::new();
        sink.expect_send_event()
            .times(NOTIFICATION_LIMIT as usize)
            .returning(|_, _| Ok(()));

        let forwarder = SampleForwarder::new(Arc::new(sink));
        let s = sample();

        let mut forwarded = 0;
        for _ in 0..NOTIFICATION_LIMIT + 5 {
            if forwarder.handle("Temperature", &s).await.unwrap() {
                forwarded += 1;
            }
        }

        assert_eq!(forwarded, NOTIFICATION_LIMIT);
        assert_eq!(forwarder.forwarded(), NOTIFICATION_LIMIT);
        assert!(forwarder.is_complete());
    }

    #[tokio::test]
    async fn test_reset_rearms_cap() {
        let mut sink = MockCloudSink::new();
        sink.expect_send_event().times(4).returning(|_, _| Ok(()));

        let forwarder = SampleForwarder::with_limit(Arc::new(sink), 2);
        let s = sample();

        for _ in 0..5 {
            forwarder.handle("Humidity", &s).await.unwrap();
        }
        assert!(forwarder.is_complete());

        forwarder.reset();
        assert_eq!(forwarder.forwarded(), 0);

        for _ in 0..5 {
            forwarder.handle("Humidity", &s).await.unwrap();
        }
        assert_eq!(forwarder.forwarded(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cap_holds_under_concurrent_delivery() {
        let mut sink = MockCloudSink::new();
        sink.expect_send_event()
            .times(NOTIFICATION_LIMIT as usize)
            .returning(|_, _| Ok(()));

        let forwarder = Arc::new(SampleForwarder::new(Arc::new(sink)));

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let forwarder = forwarder.clone();
            tasks.push(tokio::spawn(async move {
                forwarder.handle("Pressure", &sample()).await.unwrap()
            }));
        }

        let mut forwarded = 0;
        for task in tasks {
            if task.await.unwrap() {
                forwarded += 1;
            }
        }

        assert_eq!(forwarded, NOTIFICATION_LIMIT);
        assert_eq!(forwarder.forwarded(), NOTIFICATION_LIMIT);
    }

    #[tokio::test]
    async fn test_sink_error_propagates() {
        let mut sink = MockCloudSink::new();
        sink.expect_send_event()
            .times(1)
            .returning(|_, _| Err(crate::error::Error::CloudNotConnected));

        let forwarder = SampleForwarder::new(Arc::new(sink));
        let err = forwarder.handle("Switch", &sample()).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::CloudNotConnected));
    }
}
