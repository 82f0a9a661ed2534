//! BLE adapter/scan helpers, grounded in the teacher's `ble.rs`
//! `get_adapter`/`scan_for_devices` pair, generalized from a fixed
//! name-prefix filter to OMRON's advertised parent service UUID.

use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::time;

use crate::transport::PARENT_SERVICE_UUID;

#[derive(Debug)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub peripheral: Peripheral,
}

pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.context("failed to create BLE manager")?;
    manager.adapters().await.context("failed to get BLE adapters")?.into_iter().next().context(
        "no BLE adapters found",
    )
}

/// Scan for OMRON devices (those advertising `PARENT_SERVICE_UUID`),
/// optionally narrowed to a single MAC address.
pub async fn scan_for_devices(
    adapter: &Adapter,
    timeout: Duration,
    mac_filter: Option<&str>,
) -> Result<Vec<DiscoveredDevice>> {
    adapter.start_scan(ScanFilter::default()).await.context("failed to start BLE scan")?;

    let mut events = adapter.events().await.context("failed to get adapter events")?;
    let deadline = time::Instant::now() + timeout;
    let mut found = std::collections::HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match time::timeout(remaining, events.next()).await {
            Ok(Some(CentralEvent::DeviceDiscovered(id))) => {
                found.insert(id);
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    adapter.stop_scan().await.ok();

    let mut devices = Vec::new();
    for p in adapter.peripherals().await? {
        let Ok(Some(props)) = p.properties().await else { continue };
        if let Some(mac) = mac_filter {
            if !props.address.to_string().eq_ignore_ascii_case(mac) {
                continue;
            }
        } else if !props.services.contains(&PARENT_SERVICE_UUID) {
            continue;
        }
        devices.push(DiscoveredDevice {
            name: props.local_name.unwrap_or_default(),
            address: props.address.to_string(),
            peripheral: p,
        });
    }

    Ok(devices)
}
