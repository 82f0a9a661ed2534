//! Sink adapter (C5): a uniform trait over the cloud fitness service and
//! the pub/sub bus, each with its own duplicate-probe strategy.

pub mod bus;
pub mod cloud;

use async_trait::async_trait;

use crate::error::BridgeError;
use crate::models::BloodPressureReading;

/// One outbound destination for decoded readings.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Human-readable name for logs and the sync summary.
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;

    /// Pre-fetch whatever state is needed to answer `is_duplicate` cheaply
    /// for every reading in `readings` (e.g. a date-range query against the
    /// remote service), batched once per sync cycle.
    async fn probe(&mut self, readings: &[BloodPressureReading]) -> Result<(), BridgeError>;

    /// Check a single reading against the most recent `probe` result.
    fn is_duplicate(&self, reading: &BloodPressureReading) -> bool;

    async fn push(&mut self, reading: &BloodPressureReading) -> Result<(), BridgeError>;

    async fn push_many(
        &mut self,
        readings: &[BloodPressureReading],
    ) -> Result<(usize, usize), BridgeError> {
        let mut pushed = 0;
        let mut skipped = 0;
        for reading in readings {
            if self.is_duplicate(reading) {
                skipped += 1;
                continue;
            }
            match self.push(reading).await {
                Ok(()) => pushed += 1,
                Err(e) => {
                    tracing::error!("{} push failed: {e}", self.name());
                    skipped += 1;
                }
            }
        }
        Ok((pushed, skipped))
    }

    async fn disconnect(&mut self) -> Result<(), BridgeError>;

    /// Publish a bridge lifecycle status (`online`, `synced`, `offline`).
    /// Only the bus sink has a meaningful destination for this; other
    /// sinks no-op.
    async fn publish_status(
        &mut self,
        _status: &str,
        _message: Option<&str>,
    ) -> Result<(), BridgeError> {
        Ok(())
    }
}
