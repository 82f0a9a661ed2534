//! Cloud fitness sink, grounded in `garmin_uploader.py`'s `GarminUploader`.
//!
//! The concrete vendor HTTP surface is out of scope (per spec, no vendor
//! SDK is pulled in); only the OAuth-token-file contract and the
//! measurement create/query endpoints are modeled, behind the
//! [`CloudFitnessClient`] trait object so the orchestrator and tests never
//! need a real network connection.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::models::BloodPressureReading;
use crate::sinks::Sink;

/// One measurement as reported back by the cloud service's query endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudMeasurement {
    pub timestamp: NaiveDateTime,
    pub systolic: u32,
    pub diastolic: u32,
    pub pulse: u32,
}

#[derive(Debug, Serialize)]
struct CreateMeasurementRequest<'a> {
    timestamp: String,
    systolic: u32,
    diastolic: u32,
    pulse: u32,
    notes: &'a str,
}

/// The OAuth-token-file + measurement CRUD contract a cloud fitness
/// service must satisfy. A `reqwest`-backed implementation is provided in
/// [`HttpCloudClient`]; tests inject a fake.
#[async_trait]
pub trait CloudFitnessClient: Send + Sync {
    async fn get_measurements(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<CloudMeasurement>, BridgeError>;

    async fn create_measurement(
        &self,
        systolic: u32,
        diastolic: u32,
        pulse: u32,
        timestamp: NaiveDateTime,
        notes: &str,
    ) -> Result<(), BridgeError>;
}

/// Loads a bearer token from disk and speaks a generic REST measurement
/// API. The exact vendor wire format is out of scope; this models the
/// token-file + create/query contract only.
pub struct HttpCloudClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpCloudClient {
    /// Build a client from a base URL and a token-file path (mirrors the
    /// Python source's `~/.garminconnect` token directory convention: the
    /// token is read once at startup, not refreshed mid-process).
    pub fn from_token_file(base_url: String, token_path: &str) -> Result<Self, BridgeError> {
        let token = std::fs::read_to_string(token_path)
            .map_err(|e| BridgeError::Sink(format!("failed to read token file {token_path}: {e}")))?
            .trim()
            .to_string();
        Ok(Self { http: reqwest::Client::new(), base_url, token })
    }
}

#[async_trait]
impl CloudFitnessClient for HttpCloudClient {
    async fn get_measurements(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<CloudMeasurement>, BridgeError> {
        let url = format!("{}/measurements", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("start", start_date.format("%Y-%m-%d").to_string()),
                ("end", end_date.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(|e| BridgeError::Sink(format!("cloud query failed: {e}")))?;
        resp.json::<Vec<CloudMeasurement>>()
            .await
            .map_err(|e| BridgeError::Sink(format!("cloud query response malformed: {e}")))
    }

    async fn create_measurement(
        &self,
        systolic: u32,
        diastolic: u32,
        pulse: u32,
        timestamp: NaiveDateTime,
        notes: &str,
    ) -> Result<(), BridgeError> {
        let url = format!("{}/measurements", self.base_url);
        let body = CreateMeasurementRequest {
            timestamp: timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            systolic,
            diastolic,
            pulse,
            notes,
        };
        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Sink(format!("cloud upload failed: {e}")))?
            .error_for_status()
            .map_err(|e| BridgeError::Sink(format!("cloud upload rejected: {e}")))?;
        Ok(())
    }
}

/// A [`Sink`] backed by a [`CloudFitnessClient`]. Duplicate detection
/// mirrors `is_duplicate_in_garmin`: a ±60s timestamp window plus an exact
/// systolic/diastolic/pulse match against a batch-probed window.
pub struct CloudSink {
    client: Box<dyn CloudFitnessClient>,
    connected: bool,
    probed: Vec<CloudMeasurement>,
}

impl CloudSink {
    pub fn new(client: Box<dyn CloudFitnessClient>) -> Self {
        Self { client, connected: false, probed: Vec::new() }
    }

    fn notes_for(reading: &BloodPressureReading) -> String {
        let mut parts = vec![format!("OMRON BLE import (slot {})", reading.user_slot)];
        if reading.irregular_heartbeat {
            parts.push("IHB detected".to_string());
        }
        if reading.body_movement {
            parts.push("Body movement detected".to_string());
        }
        parts.join(" | ")
    }
}

#[async_trait]
impl Sink for CloudSink {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn connect(&mut self) -> Result<(), BridgeError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn probe(&mut self, readings: &[BloodPressureReading]) -> Result<(), BridgeError> {
        if readings.is_empty() {
            self.probed.clear();
            return Ok(());
        }
        let min_date = readings.iter().map(|r| r.timestamp.date()).min().unwrap();
        let max_date = readings.iter().map(|r| r.timestamp.date()).max().unwrap();
        let start = min_date - chrono::Duration::days(1);
        let end = max_date + chrono::Duration::days(1);
        self.probed = self.client.get_measurements(start, end).await?;
        Ok(())
    }

    fn is_duplicate(&self, reading: &BloodPressureReading) -> bool {
        self.probed.iter().any(|existing| {
            let diff = (reading.timestamp - existing.timestamp).num_seconds().abs();
            diff <= 60
                && existing.systolic == reading.systolic
                && existing.diastolic == reading.diastolic
                && existing.pulse == reading.pulse
        })
    }

    async fn push(&mut self, reading: &BloodPressureReading) -> Result<(), BridgeError> {
        let notes = Self::notes_for(reading);
        self.client
            .create_measurement(
                reading.systolic,
                reading.diastolic,
                reading.pulse,
                reading.timestamp,
                &notes,
            )
            .await
    }

    async fn disconnect(&mut self) -> Result<(), BridgeError> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct FakeClient {
        existing: Vec<CloudMeasurement>,
        created: Mutex<Vec<(u32, u32, u32)>>,
    }

    #[async_trait]
    impl CloudFitnessClient for FakeClient {
        async fn get_measurements(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<CloudMeasurement>, BridgeError> {
            Ok(self.existing.clone())
        }

        async fn create_measurement(
            &self,
            systolic: u32,
            diastolic: u32,
            pulse: u32,
            _timestamp: NaiveDateTime,
            _notes: &str,
        ) -> Result<(), BridgeError> {
            self.created.lock().unwrap().push((systolic, diastolic, pulse));
            Ok(())
        }
    }

    fn reading() -> BloodPressureReading {
        BloodPressureReading {
            timestamp: NaiveDate::from_ymd_opt(2025, 12, 26)
                .unwrap()
                .and_hms_opt(22, 59, 22)
                .unwrap(),
            systolic: 139,
            diastolic: 83,
            pulse: 73,
            irregular_heartbeat: true,
            body_movement: false,
            user_slot: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_window_is_inclusive_of_sixty_seconds_s5() {
        let existing = CloudMeasurement {
            timestamp: reading().timestamp + chrono::Duration::seconds(60),
            systolic: 139,
            diastolic: 83,
            pulse: 73,
        };
        let client = FakeClient { existing: vec![existing], created: Mutex::new(vec![]) };
        let mut sink = CloudSink::new(Box::new(client));
        sink.probe(&[reading()]).await.unwrap();
        assert!(sink.is_duplicate(&reading()));
    }

    #[tokio::test]
    async fn values_must_match_exactly_to_count_as_duplicate() {
        let existing = CloudMeasurement {
            timestamp: reading().timestamp,
            systolic: 140,
            diastolic: 83,
            pulse: 73,
        };
        let client = FakeClient { existing: vec![existing], created: Mutex::new(vec![]) };
        let mut sink = CloudSink::new(Box::new(client));
        sink.probe(&[reading()]).await.unwrap();
        assert!(!sink.is_duplicate(&reading()));
    }

    #[tokio::test]
    async fn push_many_skips_duplicates_and_pushes_the_rest() {
        let client = FakeClient { existing: vec![], created: Mutex::new(vec![]) };
        let mut sink = CloudSink::new(Box::new(client));
        sink.probe(&[reading()]).await.unwrap();
        let (pushed, skipped) = sink.push_many(&[reading()]).await.unwrap();
        assert_eq!(pushed, 1);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn notes_include_flags_when_set() {
        let notes = CloudSink::notes_for(&reading());
        assert!(notes.contains("slot 1"));
        assert!(notes.contains("IHB detected"));
        assert!(!notes.contains("Body movement"));
    }
}
