//! Telemetry sources feeding periodic telemetry

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Producer of telemetry samples
///
/// The session forwards every sample it receives, in order, until the source
/// returns `None` or periodic telemetry is switched off.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn next_sample(&self) -> Option<Bytes>;
}

#[derive(Debug, Serialize)]
struct Sample {
    sequence: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Emits a JSON `{sequence, timestamp}` sample on every tick
pub struct IntervalTelemetrySource {
    ticker: Mutex<Interval>,
    sequence: AtomicU64,
}

impl IntervalTelemetrySource {
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: Mutex::new(ticker),
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TelemetrySource for IntervalTelemetrySource {
    async fn next_sample(&self) -> Option<Bytes> {
        self.ticker.lock().await.tick().await;

        let sample = Sample {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: chrono::Utc::now(),
        };
        serde_json::to_vec(&sample).ok().map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interval_source_sequences_samples() {
        let source = IntervalTelemetrySource::new(Duration::from_millis(5));

        for expected in 0..3u64 {
            let sample = source.next_sample().await.expect("sample");
            let value: serde_json::Value = serde_json::from_slice(&sample).unwrap();
            assert_eq!(value["sequence"], expected);
            assert!(value["timestamp"].is_string());
        }
    }
}
