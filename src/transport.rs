//! Multi-channel framed transport (C1): TX0..TX3 / RX0..RX3 characteristic
//! banks, XOR-CRC framing, send-and-wait with retry, and the
//! start/end-transmission session verbs.
//!
//! Grounded in the notification-task-to-channel adapter pattern used for
//! single-channel BLE connections, generalized here to four parallel
//! channels keyed by characteristic UUID.

use std::time::Duration;

use anyhow::{Context, Result};
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BridgeError, ProtocolError};

/// OMRON's GATT service UUID; every supported model exposes this.
pub const PARENT_SERVICE_UUID: Uuid = Uuid::from_u128(0xecbe3980_c9a2_11e1_b1bd_0002a5d5c51b);

pub const RX_CHANNEL_UUIDS: [Uuid; 4] = [
    Uuid::from_u128(0x49123040_aee8_11e1_a74d_0002a5d5c51b),
    Uuid::from_u128(0x4d0bf320_aee8_11e1_a0d9_0002a5d5c51b),
    Uuid::from_u128(0x5128ce60_aee8_11e1_b84b_0002a5d5c51b),
    Uuid::from_u128(0x560f1420_aee8_11e1_8184_0002a5d5c51b),
];

pub const TX_CHANNEL_UUIDS: [Uuid; 4] = [
    Uuid::from_u128(0xdb5b55e0_aee7_11e1_965e_0002a5d5c51b),
    Uuid::from_u128(0xe0b8a060_aee7_11e1_92f4_0002a5d5c51b),
    Uuid::from_u128(0x0ae12b00_aee8_11e1_a192_0002a5d5c51b),
    Uuid::from_u128(0x10e1ba60_aee8_11e1_89e5_0002a5d5c51b),
];

pub const UNLOCK_UUID: Uuid = Uuid::from_u128(0xb305b680_aee7_11e1_a730_0002a5d5c51b);

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 5;

/// Session lifecycle, per spec §4.1: `idle -> opened -> closed`. EEPROM
/// ops require `Opened`; `Closed` drops further RX notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Unlocked,
    Opened,
    Closed,
}

/// A reassembled, CRC-verified application frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub packet_type: u16,
    pub address: u16,
    pub payload: Vec<u8>,
}

/// One fragment arriving on a notify channel, tagged with its channel index.
/// `None` marks the dedicated unlock channel.
struct RxFragment {
    channel: Option<usize>,
    data: Vec<u8>,
}

/// An active, exclusively-owned BLE session with an OMRON device.
pub struct Transport {
    peripheral: Peripheral,
    tx_chars: Vec<Characteristic>,
    unlock_char: Characteristic,
    rx: mpsc::Receiver<RxFragment>,
    state: SessionState,
    _listener: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Connect to an already-discovered peripheral and subscribe to all
    /// RX + unlock notifications through a single background task.
    pub async fn connect(peripheral: Peripheral) -> Result<Self> {
        if !peripheral.is_connected().await? {
            peripheral.connect().await.context("failed to connect to device")?;
        }
        peripheral
            .discover_services()
            .await
            .context("failed to discover GATT services")?;

        let chars = peripheral.characteristics();

        let tx_chars: Vec<Characteristic> = TX_CHANNEL_UUIDS
            .iter()
            .map(|uuid| {
                chars
                    .iter()
                    .find(|c| &c.uuid == uuid)
                    .cloned()
                    .with_context(|| format!("TX characteristic {uuid} not found"))
            })
            .collect::<Result<_>>()?;

        let rx_chars: Vec<Characteristic> = RX_CHANNEL_UUIDS
            .iter()
            .map(|uuid| {
                chars
                    .iter()
                    .find(|c| &c.uuid == uuid)
                    .cloned()
                    .with_context(|| format!("RX characteristic {uuid} not found"))
            })
            .collect::<Result<_>>()?;

        let unlock_char = chars
            .iter()
            .find(|c| c.uuid == UNLOCK_UUID)
            .cloned()
            .context("unlock characteristic not found")?;

        for c in rx_chars.iter().chain(std::iter::once(&unlock_char)) {
            peripheral.subscribe(c).await.context("failed to subscribe to notifications")?;
        }

        let (tx, rx) = mpsc::channel::<RxFragment>(64);
        let mut stream = peripheral.notifications().await?;
        let rx_uuids = RX_CHANNEL_UUIDS;
        let unlock_uuid = UNLOCK_UUID;

        let listener = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let channel = rx_uuids.iter().position(|u| *u == notification.uuid);
                if channel.is_none() && notification.uuid != unlock_uuid {
                    continue;
                }
                let fragment = RxFragment { channel, data: notification.value };
                if tx.send(fragment).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            peripheral,
            tx_chars,
            unlock_char,
            rx,
            state: SessionState::Idle,
            _listener: listener,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.context("failed to disconnect")?;
        Ok(())
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Write raw bytes to the unlock characteristic (used by Protocol's
    /// unlock/pair operations, which bypass the multi-channel framing).
    pub async fn write_unlock(&self, data: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.unlock_char, data, WriteType::WithResponse)
            .await
            .context("BLE write to unlock characteristic failed")?;
        Ok(())
    }

    /// Receive the next notification on the unlock channel.
    pub async fn recv_unlock(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("timed out waiting for unlock response");
            }
            match time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(frag)) if frag.channel.is_none() => return Ok(frag.data),
                Ok(Some(_)) => continue,
                Ok(None) => anyhow::bail!("notification channel closed"),
                Err(_) => anyhow::bail!("timed out waiting for unlock response"),
            }
        }
    }

    /// Send a pre-built command frame across TX0..TX_k and wait for exactly
    /// one complete, CRC-verified response frame, retrying the whole
    /// operation up to 5 times on timeout. The last concrete failure
    /// (CRC mismatch, timeout, or a write error) is returned once retries
    /// are exhausted, rather than collapsing every cause into a generic
    /// timeout.
    pub async fn send_and_wait(&mut self, command: &[u8]) -> Result<Frame, BridgeError> {
        let mut last_err = BridgeError::Protocol(ProtocolError::TransmissionTimeout);
        for attempt in 0..MAX_RETRIES {
            self.drain();
            if let Err(e) = self.write_fragments(command).await {
                warn!("transport write failed (attempt {attempt}): {e}");
                last_err = BridgeError::Connectivity(e.to_string());
                continue;
            }
            match self.assemble_frame(SEND_TIMEOUT).await {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    debug!("send_and_wait attempt {attempt} failed: {e}");
                    last_err = e;
                    continue;
                }
            }
        }
        Err(last_err)
    }

    async fn write_fragments(&self, command: &[u8]) -> Result<()> {
        for (idx, chunk) in command.chunks(16).enumerate() {
            let ch = self
                .tx_chars
                .get(idx)
                .context("command longer than 4 transport channels can carry")?;
            self.peripheral
                .write(ch, chunk, WriteType::WithoutResponse)
                .await
                .context("BLE write failed")?;
        }
        Ok(())
    }

    /// Buffer RX fragments by channel index until a complete frame arrives,
    /// verify its XOR-CRC, and return it. Distinguishes a CRC mismatch from
    /// a plain timeout or a closed notification channel so the caller can
    /// tell them apart after retries are exhausted.
    async fn assemble_frame(&mut self, timeout: Duration) -> Result<Frame, BridgeError> {
        let mut channel_buf: [Option<Vec<u8>>; 4] = [None, None, None, None];
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Protocol(ProtocolError::TransmissionTimeout));
            }
            let frag = match time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(f)) => f,
                Ok(None) => {
                    return Err(BridgeError::Connectivity("notification channel closed".to_string()))
                }
                Err(_) => return Err(BridgeError::Protocol(ProtocolError::TransmissionTimeout)),
            };
            let Some(idx) = frag.channel else { continue };
            channel_buf[idx] = Some(frag.data);

            let Some(first) = &channel_buf[0] else { continue };
            let packet_size = first[0] as usize;
            let required = packet_size.div_ceil(16);
            if (0..required).any(|i| channel_buf[i].is_none()) {
                continue;
            }

            let mut combined = Vec::with_capacity(packet_size);
            for slot in channel_buf.iter().take(required) {
                combined.extend_from_slice(slot.as_ref().unwrap());
            }
            combined.truncate(packet_size);

            let xor = combined.iter().fold(0u8, |acc, b| acc ^ b);
            if xor != 0 {
                return Err(BridgeError::Protocol(ProtocolError::CrcFailure(combined)));
            }

            let packet_type = u16::from_be_bytes([combined[1], combined[2]]);
            let address = u16::from_be_bytes([combined[3], combined[4]]);
            let len = combined[5] as usize;
            let payload = if packet_type == 0x8f00 {
                combined.get(6..7).unwrap_or(&[]).to_vec()
            } else {
                combined.get(6..6 + len).unwrap_or(&[]).to_vec()
            };

            return Ok(Frame { packet_type, address, payload });
        }
    }

    /// Build a framed command with header + XOR-CRC trailer, per spec §4.1.
    ///
    /// `len_field` and `payload` are independent: read commands carry a
    /// requested block size in the length field with no payload bytes at
    /// all, while write commands carry the data itself as `payload` with
    /// `len_field == payload.len()`.
    pub fn build_command(packet_type: u16, address: u16, len_field: u8, payload: &[u8]) -> Vec<u8> {
        let size = 6 + payload.len() + 2;
        let mut frame = Vec::with_capacity(size);
        frame.push(size as u8);
        frame.extend_from_slice(&packet_type.to_be_bytes());
        frame.extend_from_slice(&address.to_be_bytes());
        frame.push(len_field);
        frame.extend_from_slice(payload);
        frame.push(0x00); // reserved
        let xor = frame.iter().fold(0u8, |acc, b| acc ^ b);
        frame.push(xor);
        frame
    }

    /// Start a data read-out session: request type 0x0000/len 0x10, expect
    /// response type 0x8000.
    pub async fn start_transmission(&mut self) -> Result<(), BridgeError> {
        let cmd = Self::build_command(0x0000, 0x0000, 0x10, &[]);
        let frame = self.send_and_wait(&cmd).await?;
        if frame.packet_type != 0x8000 {
            return Err(BridgeError::Protocol(ProtocolError::UnexpectedOpcode(frame.packet_type)));
        }
        self.state = SessionState::Opened;
        Ok(())
    }

    /// End the data read-out session: request type 0x0f00, expect response
    /// type 0x8f00 with a one-byte error code.
    pub async fn end_transmission(&mut self) -> Result<(), BridgeError> {
        let cmd = Self::build_command(0x0f00, 0x0000, 0x00, &[]);
        let frame = self.send_and_wait(&cmd).await?;
        if frame.packet_type != 0x8f00 {
            return Err(BridgeError::Protocol(ProtocolError::UnexpectedOpcode(frame.packet_type)));
        }
        if let Some(&code) = frame.payload.first() {
            if code != 0 {
                return Err(BridgeError::Protocol(ProtocolError::DeviceReported(code)));
            }
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn mark_unlocked(&mut self) {
        self.state = SessionState::Unlocked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_xor_crc_is_zero() {
        for payload_len in [0usize, 1, 8, 50] {
            let payload = vec![0xABu8; payload_len];
            let frame = Transport::build_command(0x01c0, 0x0098, payload_len as u8, &payload);
            let xor = frame.iter().fold(0u8, |acc, b| acc ^ b);
            assert_eq!(xor, 0, "XOR of frame bytes must be zero for len {payload_len}");
        }
    }

    #[test]
    fn build_command_header_layout() {
        let payload = vec![1, 2, 3];
        let frame = Transport::build_command(0x01c0, 0x0098, payload.len() as u8, &payload);
        assert_eq!(frame[0] as usize, frame.len());
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 0x01c0);
        assert_eq!(u16::from_be_bytes([frame[3], frame[4]]), 0x0098);
        assert_eq!(frame[5] as usize, payload.len());
        assert_eq!(&frame[6..6 + payload.len()], &payload[..]);
        assert_eq!(frame[frame.len() - 2], 0x00);
    }

    #[test]
    fn start_and_end_transmission_commands_match_device_constants() {
        let start = Transport::build_command(0x0000, 0x0000, 0x10, &[]);
        assert_eq!(start, vec![0x08, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x18]);

        let end = Transport::build_command(0x0f00, 0x0000, 0x00, &[]);
        assert_eq!(end, vec![0x08, 0x0f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07]);
    }
}
