//! Pub/sub bus sink, grounded in `mqtt_publisher.py`'s `MQTTPublisher`.
//!
//! Implemented over `rumqttc`, the idiomatic async Rust MQTT client —
//! `paho-mqtt`'s C-binding equivalent isn't used anywhere in this pack, so
//! `rumqttc` is the natural substitution (noted in DESIGN.md).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::models::BloodPressureReading;
use crate::sinks::Sink;

#[derive(Debug, Serialize)]
struct ReadingPayload<'a> {
    timestamp: String,
    systolic: u32,
    diastolic: u32,
    pulse: u32,
    category: &'a str,
    irregular_heartbeat: bool,
    body_movement: bool,
    user_slot: u32,
    device: &'static str,
    published_at: String,
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    status: &'a str,
    message: Option<&'a str>,
    timestamp: String,
}

/// Sanitize a user identifier for use as an MQTT topic segment, exactly as
/// `_get_topic` does: `@`, spaces, and `/` are replaced.
fn sanitize_topic_segment(id: &str) -> String {
    id.replace('@', "_at_").replace(' ', "_").replace('/', "_")
}

pub struct BusSink {
    client: AsyncClient,
    _event_loop: JoinHandle<()>,
    base_topic: String,
    connected: bool,
    /// `user_slot -> remote_identity`, from `config.users[]`. Readings for
    /// a slot not present here fall back to the raw slot number.
    user_identities: HashMap<u32, String>,
}

impl BusSink {
    pub fn new(
        host: &str,
        port: u16,
        base_topic: &str,
        client_id: &str,
        user_identities: HashMap<u32, String>,
    ) -> Self {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(std::time::Duration::from_secs(60));
        let (client, mut event_loop) = AsyncClient::new(opts, 10);
        let handle = tokio::spawn(async move {
            loop {
                if event_loop.poll().await.is_err() {
                    break;
                }
            }
        });
        Self {
            client,
            _event_loop: handle,
            base_topic: base_topic.to_string(),
            connected: false,
            user_identities,
        }
    }

    /// Resolve the topic identity for a user slot: the configured
    /// `remote_identity`, or the raw slot number if unlisted.
    fn identity_for(&self, user_slot: u32) -> String {
        self.user_identities.get(&user_slot).cloned().unwrap_or_else(|| user_slot.to_string())
    }

    fn topic_for(&self, user_identifier: Option<&str>) -> String {
        match user_identifier {
            Some(id) => format!("{}/{}", self.base_topic, sanitize_topic_segment(id)),
            None => self.base_topic.clone(),
        }
    }

    fn payload_for(reading: &BloodPressureReading) -> ReadingPayload<'_> {
        ReadingPayload {
            timestamp: reading.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            systolic: reading.systolic,
            diastolic: reading.diastolic,
            pulse: reading.pulse,
            category: reading.category().as_str(),
            irregular_heartbeat: reading.irregular_heartbeat,
            body_movement: reading.body_movement,
            user_slot: reading.user_slot,
            device: "OMRON",
            published_at: Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    /// Publish a bridge lifecycle status message (`online`, `offline`,
    /// `syncing`) to `<base_topic>/status`.
    pub async fn publish_status(
        &mut self,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), BridgeError> {
        let topic = format!("{}/status", self.base_topic);
        let payload = StatusPayload {
            status,
            message,
            timestamp: Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| BridgeError::Sink(format!("status payload encode failed: {e}")))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, true, body)
            .await
            .map_err(|e| BridgeError::Sink(format!("status publish failed: {e}")))
    }
}

#[async_trait]
impl Sink for BusSink {
    fn name(&self) -> &str {
        "bus"
    }

    async fn connect(&mut self) -> Result<(), BridgeError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// The bus has no remote query surface to probe against; duplicate
    /// detection for this sink is delegated entirely to the ledger
    /// upstream, so this is a no-op.
    async fn probe(&mut self, _readings: &[BloodPressureReading]) -> Result<(), BridgeError> {
        Ok(())
    }

    fn is_duplicate(&self, _reading: &BloodPressureReading) -> bool {
        false
    }

    async fn push(&mut self, reading: &BloodPressureReading) -> Result<(), BridgeError> {
        let topic = self.topic_for(Some(&self.identity_for(reading.user_slot)));
        let payload = Self::payload_for(reading);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| BridgeError::Sink(format!("payload encode failed: {e}")))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, true, body)
            .await
            .map_err(|e| BridgeError::Sink(format!("publish failed: {e}")))
    }

    async fn disconnect(&mut self) -> Result<(), BridgeError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Sink(format!("disconnect failed: {e}")))?;
        self.connected = false;
        Ok(())
    }

    async fn publish_status(
        &mut self,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), BridgeError> {
        BusSink::publish_status(self, status, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_sanitization_replaces_at_space_and_slash() {
        assert_eq!(sanitize_topic_segment("user@example.com"), "user_at_example.com");
        assert_eq!(sanitize_topic_segment("slot 1/2"), "slot_1_2");
    }

    #[tokio::test]
    async fn identity_for_falls_back_to_numeric_slot_when_unlisted() {
        let mut identities = HashMap::new();
        identities.insert(1, "alice".to_string());
        let sink = BusSink::new("localhost", 1883, "omron/bp", "test-client", identities);
        assert_eq!(sink.identity_for(1), "alice");
        assert_eq!(sink.identity_for(2), "2");
    }
}
