//! Sync orchestrator (C6), grounded in `main.py`'s `OmronGarminBridge`:
//! one-shot `sync()` cycle plus a `run_daemon` loop with graceful
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::devices::DeviceModel;
use crate::discovery;
use crate::driver;
use crate::error::BridgeError;
use crate::ledger::Ledger;
use crate::models::BloodPressureReading;
use crate::protocol;
use crate::sinks::Sink;
use crate::transport::Transport;

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone)]
pub struct SinkSummary {
    pub pushed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone)]
pub struct SyncSummary {
    pub timestamp: Option<NaiveDateTime>,
    pub device_records: usize,
    pub new_records: usize,
    pub cloud: SinkSummary,
    pub bus: SinkSummary,
    pub errors: Vec<String>,
}

pub struct Orchestrator {
    config: Config,
    ledger: Ledger,
    cloud: Option<Box<dyn Sink>>,
    bus: Option<Box<dyn Sink>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        ledger: Ledger,
        cloud: Option<Box<dyn Sink>>,
        bus: Option<Box<dyn Sink>>,
    ) -> Self {
        Self { config, ledger, cloud, bus }
    }

    fn pairing_key(&self) -> Result<[u8; 16], BridgeError> {
        match &self.config.omron.pairing_key_hex {
            Some(hex) => parse_hex_key(hex),
            None => Ok(protocol::DEFAULT_PAIRING_KEY),
        }
    }

    async fn read_from_device(&self) -> Result<Vec<BloodPressureReading>, BridgeError> {
        let model = DeviceModel::from_name(&self.config.omron.device_model).ok_or_else(|| {
            BridgeError::Decode(format!(
                "unsupported device model '{}'",
                self.config.omron.device_model
            ))
        })?;
        let driver_impl = model.driver();

        info!("connecting to OMRON {}...", model.name());
        let adapter = discovery::get_adapter()
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
        let devices = discovery::scan_for_devices(
            &adapter,
            SCAN_TIMEOUT,
            self.config.omron.mac_address.as_deref(),
        )
        .await
        .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
        let device = devices
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::Connectivity("no OMRON device found".to_string()))?;
        info!("found device {} [{}]", device.name, device.address);

        let mut transport = Transport::connect(device.peripheral)
            .await
            .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
        info!("connected to device");

        let key = self.pairing_key()?;
        let use_unread_counter = self.config.omron.read_mode == "new_only";

        info!("reading records...");
        let result = driver::read_all_records(
            &mut transport,
            &key,
            driver_impl.as_ref(),
            use_unread_counter,
            self.config.omron.sync_time,
        )
        .await;

        transport.disconnect().await.ok();
        info!("disconnected from device");

        let readings: Vec<BloodPressureReading> = result?.into_iter().flatten().collect();
        info!("read {} records from device", readings.len());
        Ok(readings)
    }

    async fn filter_new_records(
        &self,
        records: Vec<BloodPressureReading>,
    ) -> Result<Vec<BloodPressureReading>, BridgeError> {
        let new_records = self.ledger.filter_new_async(records.clone()).await?;
        info!("new records: {}, duplicates: {}", new_records.len(), records.len() - new_records.len());
        Ok(new_records)
    }

    /// Connect every enabled sink that isn't already connected. Returns
    /// `true` if at least one sink ended up connected (or no sink is
    /// enabled at all, in which case there's nothing to fail on).
    async fn connect_sinks(&mut self, summary: &mut SyncSummary) -> bool {
        let mut any_connected = false;
        if let Some(sink) = self.cloud.as_deref_mut() {
            if sink.is_connected() {
                any_connected = true;
            } else if let Err(e) = sink.connect().await {
                warn!("cloud sink connect failed: {e}");
                summary.errors.push(format!("cloud connect failed: {e}"));
            } else {
                any_connected = true;
            }
        }
        if let Some(sink) = self.bus.as_deref_mut() {
            if sink.is_connected() {
                any_connected = true;
            } else if let Err(e) = sink.connect().await {
                warn!("bus sink connect failed: {e}");
                summary.errors.push(format!("bus connect failed: {e}"));
            } else {
                any_connected = true;
            }
        }
        any_connected
    }

    /// Run one full sync cycle: connect sinks, read device, dedupe, push
    /// to enabled sinks, publish a status update. Errors from individual
    /// sink pushes are collected into the summary rather than aborting
    /// the cycle, matching spec §7's partial-failure policy; a cycle
    /// where no enabled sink connects at all fails outright.
    pub async fn sync(&mut self, dry_run: bool) -> SyncSummary {
        let mut summary = SyncSummary { timestamp: Some(now()), ..Default::default() };

        if !dry_run && !self.connect_sinks(&mut summary).await {
            error!("no enabled sink connected; aborting cycle");
            summary.errors.push("no enabled sink connected".to_string());
            return summary;
        }

        let records = match self.read_from_device().await {
            Ok(r) => r,
            Err(e) => {
                error!("failed to read from device: {e}");
                summary.errors.push(e.to_string());
                return summary;
            }
        };
        summary.device_records = records.len();
        if records.is_empty() {
            info!("no records on device");
            self.publish_idle().await;
            return summary;
        }

        let new_records = match self.filter_new_records(records).await {
            Ok(r) => r,
            Err(e) => {
                error!("ledger error: {e}");
                summary.errors.push(e.to_string());
                return summary;
            }
        };
        summary.new_records = new_records.len();
        if new_records.is_empty() {
            info!("no new records to sync");
            self.publish_idle().await;
            return summary;
        }

        for (i, r) in new_records.iter().enumerate() {
            let mut flags = Vec::new();
            if r.irregular_heartbeat {
                flags.push("IHB");
            }
            if r.body_movement {
                flags.push("MOV");
            }
            let flag_suffix =
                if flags.is_empty() { String::new() } else { format!(" [{}]", flags.join(", ")) };
            info!(
                "{}. {} | {}/{} mmHg | {} bpm | user {} | {}{}",
                i + 1,
                r.timestamp.format("%Y-%m-%d %H:%M"),
                r.systolic,
                r.diastolic,
                r.pulse,
                r.user_slot,
                r.category().as_str(),
                flag_suffix,
            );
        }

        if dry_run {
            info!("dry run - no changes made");
            return summary;
        }

        let Self { config, ledger, cloud, bus, .. } = self;

        if let Some(sink) = cloud.as_deref_mut() {
            summary.cloud = drive_sink(ledger, sink, &new_records, true, config).await;
        }
        if let Some(sink) = bus.as_deref_mut() {
            summary.bus = drive_sink(ledger, sink, &new_records, false, config).await;
        }

        if let Some(sink) = self.bus.as_deref_mut() {
            let _ = sink
                .publish_status("synced", Some(&format!("synced {} new records", summary.new_records)))
                .await;
        }

        summary
    }

    async fn publish_idle(&mut self) {
        if let Some(sink) = self.bus.as_deref_mut() {
            let _ = sink.publish_status("idle", None).await;
        }
    }

    /// Re-attempt delivery for every ledger row not yet marked
    /// `cloud_delivered`, up to `limit` rows per call.
    pub async fn retry_pending_cloud(&mut self, limit: i64) -> Result<SinkSummary, BridgeError> {
        let Self { ledger, cloud, .. } = self;
        let Some(sink) = cloud.as_deref_mut() else {
            return Ok(SinkSummary::default());
        };
        retry_pending(ledger, sink, limit, true).await
    }

    /// Re-attempt delivery for every ledger row not yet marked
    /// `bus_delivered`, up to `limit` rows per call.
    pub async fn retry_pending_bus(&mut self, limit: i64) -> Result<SinkSummary, BridgeError> {
        let Self { ledger, bus, .. } = self;
        let Some(sink) = bus.as_deref_mut() else {
            return Ok(SinkSummary::default());
        };
        retry_pending(ledger, sink, limit, false).await
    }

    /// Publish an `offline` status and disconnect every enabled sink.
    /// Called on daemon shutdown.
    pub async fn cleanup(&mut self) {
        if let Some(sink) = self.bus.as_deref_mut() {
            let _ = sink.publish_status("offline", None).await;
        }
        if let Some(sink) = self.cloud.as_deref_mut() {
            let _ = sink.disconnect().await;
        }
        if let Some(sink) = self.bus.as_deref_mut() {
            let _ = sink.disconnect().await;
        }
    }

    /// Run sync cycles forever at the configured interval, sleeping in
    /// 1-second ticks so shutdown is never more than a second late.
    /// `shutdown` is checked each tick and can be set from a signal
    /// handler running concurrently.
    pub async fn run_daemon(&mut self, shutdown: Arc<AtomicBool>) {
        let interval = Duration::from_secs(self.config.omron.poll_interval_minutes * 60);
        info!("starting daemon with {:?} interval", interval);

        if let Some(sink) = self.bus.as_deref_mut() {
            let _ = sink.publish_status("online", None).await;
        }

        while !shutdown.load(Ordering::SeqCst) {
            info!("starting sync cycle...");
            let summary = self.sync(false).await;
            info!(
                "sync complete: {} new records, cloud: {} uploaded, bus: {} published",
                summary.new_records, summary.cloud.pushed, summary.bus.pushed
            );
            if !summary.errors.is_empty() {
                warn!("sync cycle had {} error(s): {:?}", summary.errors.len(), summary.errors);
            }

            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            info!("sleeping for {:?}...", interval);
            let ticks = interval.as_secs().max(1);
            for _ in 0..ticks {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        self.cleanup().await;
        info!("daemon stopped");
    }
}

async fn drive_sink(
    ledger: &Ledger,
    sink: &mut dyn Sink,
    records: &[BloodPressureReading],
    cloud: bool,
    config: &Config,
) -> SinkSummary {
    let mut summary = SinkSummary::default();

    if !sink.is_connected() {
        if let Err(e) = sink.connect().await {
            error!("{} connect failed: {e}", sink.name());
            summary.failed = records.len();
            return summary;
        }
    }
    if let Err(e) = sink.probe(records).await {
        error!("{} probe failed: {e}", sink.name());
        summary.failed = records.len();
        return summary;
    }

    for record in records {
        if !config.sink_enabled_for_user(record.user_slot, cloud) {
            summary.skipped += 1;
            continue;
        }
        if sink.is_duplicate(record) {
            summary.skipped += 1;
            continue;
        }
        match sink.push(record).await {
            Ok(()) => {
                summary.pushed += 1;
                let (c, b) = if cloud { (true, false) } else { (false, true) };
                if let Err(e) = ledger.mark_uploaded_async(record.clone(), c, b).await {
                    warn!("failed to record {} delivery in ledger: {e}", sink.name());
                }
            }
            Err(e) => {
                error!("{} push failed: {e}", sink.name());
                summary.failed += 1;
            }
        }
    }

    info!("{}: {} pushed, {} skipped, {} failed", sink.name(), summary.pushed, summary.skipped, summary.failed);
    summary
}

fn reading_from_row(row: &crate::models::LedgerRow) -> BloodPressureReading {
    BloodPressureReading {
        timestamp: row.timestamp,
        systolic: row.systolic,
        diastolic: row.diastolic,
        pulse: row.pulse,
        irregular_heartbeat: row.irregular_heartbeat,
        body_movement: row.body_movement,
        user_slot: row.user_slot,
    }
}

async fn retry_pending(
    ledger: &Ledger,
    sink: &mut dyn Sink,
    limit: i64,
    cloud: bool,
) -> Result<SinkSummary, BridgeError> {
    let rows =
        if cloud { ledger.pending_cloud_async(limit).await? } else { ledger.pending_bus_async(limit).await? };
    let mut summary = SinkSummary::default();
    if rows.is_empty() {
        return Ok(summary);
    }

    if !sink.is_connected() {
        sink.connect().await?;
    }
    for row in &rows {
        let reading = reading_from_row(row);
        match sink.push(&reading).await {
            Ok(()) => {
                summary.pushed += 1;
                let (c, b) = if cloud { (Some(true), None) } else { (None, Some(true)) };
                ledger.update_status_async(row.fingerprint.clone(), c, b).await?;
            }
            Err(e) => {
                warn!("retry of {} via {} failed: {e}", row.fingerprint, sink.name());
                summary.failed += 1;
            }
        }
    }
    info!("{} retry: {} pushed, {} failed", sink.name(), summary.pushed, summary.failed);
    Ok(summary)
}

fn parse_hex_key(hex: &str) -> Result<[u8; 16], BridgeError> {
    let hex = hex.trim();
    if hex.len() != 32 {
        return Err(BridgeError::Decode(format!(
            "pairing key must be 32 hex chars (16 bytes), got {}",
            hex.len()
        )));
    }
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| BridgeError::Decode(format!("invalid hex byte at offset {i}")))?;
    }
    Ok(key)
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    #[test]
    fn parse_hex_key_roundtrips_default_key() {
        let hex = "deadbeaf12341234deadbeaf12341234";
        let key = parse_hex_key(hex).unwrap();
        assert_eq!(key, protocol::DEFAULT_PAIRING_KEY);
    }

    #[test]
    fn parse_hex_key_rejects_wrong_length() {
        assert!(parse_hex_key("deadbeaf").is_err());
    }

    struct RecordingSink {
        connected: bool,
        pushed: Vec<BloodPressureReading>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "test"
        }
        async fn connect(&mut self) -> Result<(), BridgeError> {
            self.connected = true;
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        async fn probe(&mut self, _records: &[BloodPressureReading]) -> Result<(), BridgeError> {
            Ok(())
        }
        fn is_duplicate(&self, _reading: &BloodPressureReading) -> bool {
            false
        }
        async fn push(&mut self, reading: &BloodPressureReading) -> Result<(), BridgeError> {
            self.pushed.push(reading.clone());
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<(), BridgeError> {
            self.connected = false;
            Ok(())
        }
    }

    fn sample_record(user_slot: u32) -> BloodPressureReading {
        BloodPressureReading {
            timestamp: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(9, 0, 0).unwrap(),
            systolic: 120,
            diastolic: 80,
            pulse: 60,
            irregular_heartbeat: false,
            body_movement: false,
            user_slot,
        }
    }

    #[tokio::test]
    async fn drive_sink_skips_records_for_users_disabled_on_that_sink() {
        let ledger = Ledger::open_in_memory().unwrap();
        let config: Config = toml::from_str(
            r#"
            [[users]]
            user_slot = 1
            name = "Alice"
            remote_identity = "alice"
            bus_enabled = false
        "#,
        )
        .unwrap();
        let mut sink = RecordingSink { connected: false, pushed: Vec::new() };
        let records = [sample_record(1)];

        let summary = drive_sink(&ledger, &mut sink, &records, false, &config).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pushed, 0);
        assert!(sink.pushed.is_empty());
    }

    #[tokio::test]
    async fn drive_sink_pushes_and_marks_ledger_for_enabled_users() {
        let ledger = Ledger::open_in_memory().unwrap();
        let config = Config::default();
        let mut sink = RecordingSink { connected: false, pushed: Vec::new() };
        let records = [sample_record(1)];

        let summary = drive_sink(&ledger, &mut sink, &records, true, &config).await;

        assert_eq!(summary.pushed, 1);
        assert_eq!(sink.pushed.len(), 1);
        assert!(ledger.is_duplicate(&records[0].record_hash()).unwrap());
    }
}
