//! Device driver trait and model registry (C3).
//!
//! Grounded in the teacher's `Model::from_name` lookup table, generalized
//! to OMRON's per-model EEPROM layout, and in `BaseOmronDevice`'s bit
//! extraction contract and ring-buffer read-plan arithmetic.

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::models::BloodPressureReading;
use crate::protocol;
use crate::transport::Transport;

/// Per-model EEPROM layout constants.
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    pub user_start_addresses: Vec<u16>,
    pub records_per_user: Vec<usize>,
    pub record_byte_size: usize,
    pub transmission_block_size: usize,
    pub settings_read_address: u16,
    pub settings_write_address: u16,
    /// Byte range (start, end) of the unread-records section, relative to
    /// `settings_read_address`.
    pub settings_unread_records_bytes: (usize, usize),
    /// Byte range (start, end) of the time-sync section, relative to
    /// `settings_read_address`.
    pub settings_time_sync_bytes: (usize, usize),
}

/// One EEPROM read to perform: `size` bytes starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCommand {
    pub address: u16,
    pub size: usize,
}

/// A device-specific decoder and EEPROM layout. One implementer per
/// supported model (currently just the HEM-7361T).
pub trait DeviceDriver: Send + Sync {
    fn layout(&self) -> &DeviceLayout;

    /// Decode one fixed-size raw record into a reading. `user_slot` is not
    /// set here; the caller fills it in from the read-plan context.
    fn parse_record(&self, record_bytes: &[u8]) -> Result<BloodPressureReading, BridgeError>;

    /// Build the bytes to write into the time-sync settings section.
    /// `cached_section` is the previously-read time-sync section, whose
    /// first bytes this driver may need to preserve verbatim.
    fn time_sync_payload(&self, cached_section: &[u8], now: NaiveDateTime) -> Vec<u8>;
}

/// Extract bits `[first_bit, last_bit]` (inclusive, MSB-numbered bit 0)
/// from a little-endian byte array, per the original driver's
/// `_extract_bits` contract.
pub fn extract_bits(data: &[u8], first_bit: usize, last_bit: usize) -> u64 {
    let mut big_int: u128 = 0;
    for (i, byte) in data.iter().enumerate() {
        big_int |= (*byte as u128) << (8 * i);
    }
    let num_valid_bits = last_bit - first_bit + 1;
    let shift = data.len() * 8 - (last_bit + 1);
    let shifted = big_int >> shift;
    let bitmask = (1u128 << num_valid_bits) - 1;
    (shifted & bitmask) as u64
}

/// Read commands covering every record slot for every user, used for a
/// full (non-incremental) sync.
pub fn all_records_commands(layout: &DeviceLayout) -> Vec<Vec<ReadCommand>> {
    layout
        .user_start_addresses
        .iter()
        .enumerate()
        .map(|(idx, &addr)| {
            vec![ReadCommand {
                address: addr,
                size: layout.records_per_user[idx] * layout.record_byte_size,
            }]
        })
        .collect()
}

/// Calculate the read plan for one user's ring buffer, given the buffer's
/// last-written slot and unread count. Splits into two reads when the
/// unread window wraps past the start of the buffer.
pub fn calc_ring_buffer_read(
    layout: &DeviceLayout,
    user_idx: usize,
    unread: usize,
    last_slot: usize,
) -> Vec<ReadCommand> {
    let start_addr = layout.user_start_addresses[user_idx];
    let max_records = layout.records_per_user[user_idx];
    let record_size = layout.record_byte_size;

    if last_slot < unread {
        let head = ReadCommand { address: start_addr, size: record_size * last_slot };
        let wrap_addr =
            start_addr + ((max_records + last_slot - unread) * record_size) as u16;
        let tail = ReadCommand { address: wrap_addr, size: record_size * (unread - last_slot) };
        vec![head, tail]
    } else {
        let addr = start_addr + ((last_slot - unread) * record_size) as u16;
        vec![ReadCommand { address: addr, size: record_size * unread }]
    }
}

/// Read every record from the device, one slice of decoded readings per
/// user slot. Runs the full session: unlock, start-transmission, optional
/// settings cache, per-user read-plan + parse, optional reset-unread and
/// time-sync, end-transmission.
///
/// Grounded in `BaseOmronDevice.get_all_records`.
pub async fn read_all_records(
    transport: &mut Transport,
    key: &[u8; 16],
    driver: &dyn DeviceDriver,
    use_unread_counter: bool,
    sync_time: bool,
) -> Result<Vec<Vec<BloodPressureReading>>, BridgeError> {
    let layout = driver.layout().clone();

    protocol::unlock(transport, key).await?;
    transport.start_transmission().await?;

    let cached_settings = if sync_time || use_unread_counter {
        Some(cache_settings(transport, &layout).await?)
    } else {
        None
    };

    let read_commands = if use_unread_counter {
        get_unread_records_commands(&layout, cached_settings.as_deref().unwrap())
    } else {
        all_records_commands(&layout)
    };

    info!("reading data from device");
    let mut all_user_records = Vec::with_capacity(read_commands.len());
    for (user_idx, commands) in read_commands.iter().enumerate() {
        let mut user_data = Vec::new();
        for cmd in commands {
            let chunk =
                protocol::read_continuous(transport, cmd.address, cmd.size).await?;
            user_data.extend_from_slice(&chunk);
        }

        let mut user_records = Vec::new();
        for chunk in user_data.chunks(layout.record_byte_size) {
            if chunk.len() != layout.record_byte_size {
                continue;
            }
            if chunk.iter().all(|&b| b == 0xFF) {
                continue;
            }
            match driver.parse_record(chunk) {
                Ok(mut reading) => {
                    reading.user_slot = (user_idx + 1) as u32;
                    user_records.push(reading);
                }
                Err(e) => warn!("failed to parse record for user{}: {e}", user_idx + 1),
            }
        }
        info!("user {}: {} records", user_idx + 1, user_records.len());
        all_user_records.push(user_records);
    }

    if use_unread_counter {
        reset_unread_counters(transport, &layout, cached_settings.as_deref().unwrap()).await?;
    }
    if sync_time {
        sync_device_time(transport, driver, &layout, cached_settings.as_deref().unwrap()).await?;
    }

    transport.end_transmission().await?;
    Ok(all_user_records)
}

/// Read the unread-records and time-sync settings sections into one
/// contiguous buffer addressed relative to `settings_read_address`.
async fn cache_settings(
    transport: &mut Transport,
    layout: &DeviceLayout,
) -> Result<Vec<u8>, BridgeError> {
    let settings_size = (layout.settings_write_address - layout.settings_read_address) as usize;
    let mut cached = vec![0u8; settings_size];

    let (start, end) = layout.settings_unread_records_bytes;
    if end > start {
        let data = protocol::read_continuous(
            transport,
            layout.settings_read_address + start as u16,
            end - start,
        )
        .await?;
        cached[start..end].copy_from_slice(&data);
    }

    let (start, end) = layout.settings_time_sync_bytes;
    if end > start {
        let data = protocol::read_continuous(
            transport,
            layout.settings_read_address + start as u16,
            end - start,
        )
        .await?;
        cached[start..end].copy_from_slice(&data);
    }

    Ok(cached)
}

fn get_unread_records_commands(
    layout: &DeviceLayout,
    cached_settings: &[u8],
) -> Vec<Vec<ReadCommand>> {
    let (start, end) = layout.settings_unread_records_bytes;
    let info_bytes = &cached_settings[start..end];

    (0..layout.user_start_addresses.len())
        .map(|user_idx| {
            let last_slot =
                extract_bits(&info_bytes[2 * user_idx..2 * user_idx + 2], 8, 15) as usize;
            let unread =
                extract_bits(&info_bytes[2 * user_idx + 4..2 * user_idx + 6], 8, 15) as usize;
            info!("user {}: slot={last_slot}, unread={unread}", user_idx + 1);
            calc_ring_buffer_read(layout, user_idx, unread, last_slot)
        })
        .collect()
}

/// Write the `0x8000` "no new records" sentinel into every user's unread
/// counter.
///
/// Verified only for the HEM-7361T: the sentinel value and its position
/// within the settings section are not confirmed for any other OMRON
/// model. A new [`DeviceModel`](crate::devices::DeviceModel) variant must
/// re-verify this empirically before advertising `use_unread_counter`
/// support.
async fn reset_unread_counters(
    transport: &mut Transport,
    layout: &DeviceLayout,
    cached_settings: &[u8],
) -> Result<(), BridgeError> {
    let (start, end) = layout.settings_unread_records_bytes;
    let section = &cached_settings[start..end];

    let reset = 0x8000u16.to_le_bytes();
    let mut new_section = section.to_vec();
    new_section[4..6].copy_from_slice(&reset);
    new_section[6..8].copy_from_slice(&reset);

    protocol::write_continuous(
        transport,
        layout.settings_write_address + start as u16,
        &new_section,
    )
    .await
}

async fn sync_device_time(
    transport: &mut Transport,
    driver: &dyn DeviceDriver,
    layout: &DeviceLayout,
    cached_settings: &[u8],
) -> Result<(), BridgeError> {
    let (start, end) = layout.settings_time_sync_bytes;
    let section = &cached_settings[start..end];
    let now = chrono::Local::now().naive_local();
    let payload = driver.time_sync_payload(section, now);

    protocol::write_continuous(transport, layout.settings_write_address + start as u16, &payload)
        .await?;
    info!("device time synced to {now}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> DeviceLayout {
        DeviceLayout {
            user_start_addresses: vec![0x0098, 0x06D8],
            records_per_user: vec![100, 100],
            record_byte_size: 0x10,
            transmission_block_size: 0x10,
            settings_read_address: 0x0010,
            settings_write_address: 0x0054,
            settings_unread_records_bytes: (0x00, 0x10),
            settings_time_sync_bytes: (0x2C, 0x3C),
        }
    }

    #[test]
    fn extract_bits_matches_python_contract() {
        // 2 bytes, little-endian value 0x1234 -> big_int = 0x1234
        let data = [0x34u8, 0x12];
        // bits 8..15 (the high byte) of a 16-bit big_int, MSB-numbered: bit0
        // is the MSB of the 16-bit value, so bits 8..15 are its low byte.
        assert_eq!(extract_bits(&data, 8, 15), 0x34);
        assert_eq!(extract_bits(&data, 0, 7), 0x12);
    }

    #[test]
    fn ring_buffer_read_no_wrap() {
        let l = layout();
        let cmds = calc_ring_buffer_read(&l, 0, 5, 20);
        assert_eq!(cmds, vec![ReadCommand { address: 0x0098 + 15 * 0x10, size: 5 * 0x10 }]);
    }

    #[test]
    fn ring_buffer_read_wraps_s2(){
        let l = layout();
        // last_slot(3) < unread(10): must wrap around the end of the buffer.
        let cmds = calc_ring_buffer_read(&l, 0, 10, 3);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], ReadCommand { address: 0x0098, size: 3 * 0x10 });
        let expected_wrap_addr = 0x0098 + ((100 + 3 - 10) * 0x10) as u16;
        assert_eq!(cmds[1], ReadCommand { address: expected_wrap_addr, size: 7 * 0x10 });
        let total_bytes: usize = cmds.iter().map(|c| c.size).sum();
        assert_eq!(total_bytes, 10 * 0x10);
    }

    #[test]
    fn all_records_commands_covers_every_user() {
        let l = layout();
        let cmds = all_records_commands(&l);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0][0], ReadCommand { address: 0x0098, size: 100 * 0x10 });
        assert_eq!(cmds[1][0], ReadCommand { address: 0x06D8, size: 100 * 0x10 });
    }

    #[test]
    fn unread_records_commands_reads_slot_and_count_per_user() {
        let l = layout();
        // info_bytes layout: [last_slot_u0(2), last_slot_u1(2), unread_u0(2), unread_u1(2)]
        let mut settings = vec![0u8; 0x10];
        settings[0..2].copy_from_slice(&20u16.to_le_bytes());
        settings[2..4].copy_from_slice(&8u16.to_le_bytes());
        settings[4..6].copy_from_slice(&5u16.to_le_bytes());
        settings[6..8].copy_from_slice(&3u16.to_le_bytes());

        let commands = get_unread_records_commands(&l, &settings);
        assert_eq!(commands.len(), 2);
        // user0: last_slot=20, unread=5, no wrap
        assert_eq!(commands[0], vec![ReadCommand { address: 0x0098 + 15 * 0x10, size: 5 * 0x10 }]);
        // user1: last_slot=8, unread=3, no wrap
        assert_eq!(commands[1], vec![ReadCommand { address: 0x06D8 + 5 * 0x10, size: 3 * 0x10 }]);
    }

    #[test]
    fn reset_unread_counters_writes_sentinel_only_into_count_fields() {
        let mut settings = vec![0u8; 0x10];
        settings[0..2].copy_from_slice(&20u16.to_le_bytes());
        settings[2..4].copy_from_slice(&8u16.to_le_bytes());
        settings[4..6].copy_from_slice(&5u16.to_le_bytes());
        settings[6..8].copy_from_slice(&3u16.to_le_bytes());
        let original = settings.clone();

        let mut new_section = settings[0..0x10].to_vec();
        let reset = 0x8000u16.to_le_bytes();
        new_section[4..6].copy_from_slice(&reset);
        new_section[6..8].copy_from_slice(&reset);

        // Slot fields untouched, counters both set to the sentinel.
        assert_eq!(&new_section[0..4], &original[0..4]);
        assert_eq!(u16::from_le_bytes([new_section[4], new_section[5]]), 0x8000);
        assert_eq!(u16::from_le_bytes([new_section[6], new_section[7]]), 0x8000);
    }
}
