//! OMRON HEM-7361T ("M7 Intelli IT") driver: 2 users, 100 records each.
//!
//! Bit positions and the time-sync checksum are grounded directly in
//! `HEM7361T.parse_record` / `HEM7361T.get_time_sync_bytes`.

use chrono::{NaiveDate, NaiveDateTime};

use crate::driver::{extract_bits, DeviceDriver, DeviceLayout};
use crate::error::BridgeError;
use crate::models::BloodPressureReading;

pub struct Hem7361t {
    layout: DeviceLayout,
}

impl Hem7361t {
    pub fn new() -> Self {
        Self {
            layout: DeviceLayout {
                user_start_addresses: vec![0x0098, 0x06D8],
                records_per_user: vec![100, 100],
                record_byte_size: 0x10,
                transmission_block_size: 0x10,
                settings_read_address: 0x0010,
                settings_write_address: 0x0054,
                settings_unread_records_bytes: (0x00, 0x10),
                settings_time_sync_bytes: (0x2C, 0x3C),
            },
        }
    }
}

impl Default for Hem7361t {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for Hem7361t {
    fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    fn parse_record(&self, record_bytes: &[u8]) -> Result<BloodPressureReading, BridgeError> {
        if record_bytes.len() != self.layout.record_byte_size {
            return Err(BridgeError::Decode(format!(
                "expected {} record bytes, got {}",
                self.layout.record_byte_size,
                record_bytes.len()
            )));
        }

        let minute = extract_bits(record_bytes, 68, 73);
        // The device occasionally reports seconds up to 63.
        let second = extract_bits(record_bytes, 74, 79).min(59);
        let movement = extract_bits(record_bytes, 80, 80) != 0;
        let irregular_heartbeat = extract_bits(record_bytes, 81, 81) != 0;
        let month = extract_bits(record_bytes, 82, 85);
        let day = extract_bits(record_bytes, 86, 90);
        let hour = extract_bits(record_bytes, 91, 95);
        let year = extract_bits(record_bytes, 98, 103) + 2000;
        let pulse = extract_bits(record_bytes, 104, 111);
        let diastolic = extract_bits(record_bytes, 112, 119);
        let systolic = extract_bits(record_bytes, 120, 127) + 25;

        let timestamp = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
            .ok_or_else(|| {
                BridgeError::Decode(format!(
                    "invalid timestamp fields: {year}-{month}-{day} {hour}:{minute}:{second}"
                ))
            })?;

        Ok(BloodPressureReading {
            timestamp,
            systolic: systolic as u32,
            diastolic: diastolic as u32,
            pulse: pulse as u32,
            irregular_heartbeat,
            body_movement: movement,
            user_slot: 0,
        })
    }

    fn time_sync_payload(&self, cached_section: &[u8], now: NaiveDateTime) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&cached_section[0..8.min(cached_section.len())]);
        bytes.push((now.format("%Y").to_string().parse::<i32>().unwrap_or(2000) - 2000) as u8);
        bytes.push(now_month(now));
        bytes.push(now_day(now));
        bytes.push(now_hour(now));
        bytes.push(now_minute(now));
        bytes.push(now_second(now));
        let checksum = bytes.iter().fold(0u32, |acc, b| acc + *b as u32) & 0xFF;
        bytes.push(checksum as u8);
        bytes.push(0x00);
        bytes
    }
}

fn now_month(t: NaiveDateTime) -> u8 {
    use chrono::Datelike;
    t.month() as u8
}
fn now_day(t: NaiveDateTime) -> u8 {
    use chrono::Datelike;
    t.day() as u8
}
fn now_hour(t: NaiveDateTime) -> u8 {
    use chrono::Timelike;
    t.hour() as u8
}
fn now_minute(t: NaiveDateTime) -> u8 {
    use chrono::Timelike;
    t.minute() as u8
}
fn now_second(t: NaiveDateTime) -> u8 {
    use chrono::Timelike;
    t.second() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Vec<u8> {
        // Encode: 2025-12-26 22:59:22, pulse=73, dia=83, sys=114 (+25=139),
        // ihb=false, mov=false. Bits packed MSB-first across 16 bytes.
        let mut bits: u128 = 0;
        let set = |bits: &mut u128, first: usize, last: usize, value: u128| {
            let width = last - first + 1;
            let shift = 128 - (last + 1);
            *bits |= (value & ((1u128 << width) - 1)) << shift;
        };
        set(&mut bits, 68, 73, 59); // minute
        set(&mut bits, 74, 79, 22); // second
        set(&mut bits, 80, 80, 0); // mov
        set(&mut bits, 81, 81, 0); // ihb
        set(&mut bits, 82, 85, 12); // month
        set(&mut bits, 86, 90, 26); // day
        set(&mut bits, 91, 95, 22); // hour
        set(&mut bits, 98, 103, 25); // year offset (2025-2000)
        set(&mut bits, 104, 111, 73); // pulse
        set(&mut bits, 112, 119, 83); // diastolic
        set(&mut bits, 120, 127, 114); // systolic raw (139-25)

        let be_bytes = bits.to_be_bytes();
        let mut little = be_bytes[..16].to_vec();
        little.reverse();
        little
    }

    #[test]
    fn parse_record_matches_s1_scenario() {
        let driver = Hem7361t::new();
        let reading = driver.parse_record(&sample_record()).unwrap();
        assert_eq!(reading.systolic, 139);
        assert_eq!(reading.diastolic, 83);
        assert_eq!(reading.pulse, 73);
        assert!(!reading.irregular_heartbeat);
        assert!(!reading.body_movement);
        assert_eq!(reading.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(), "2025-12-26T22:59:22");
    }

    #[test]
    fn parse_record_rejects_wrong_length() {
        let driver = Hem7361t::new();
        assert!(driver.parse_record(&[0u8; 10]).is_err());
    }

    #[test]
    fn time_sync_checksum_is_sum_of_first_fourteen_bytes() {
        let driver = Hem7361t::new();
        let cached = [0xAAu8; 16];
        let now = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap().and_hms_opt(9, 30, 5).unwrap();
        let payload = driver.time_sync_payload(&cached, now);
        assert_eq!(payload.len(), 16);
        let expected_checksum = payload[..14].iter().fold(0u32, |a, b| a + *b as u32) & 0xFF;
        assert_eq!(payload[14] as u32, expected_checksum);
        assert_eq!(payload[15], 0x00);
        assert_eq!(&payload[0..8], &cached[0..8]);
        assert_eq!(payload[8], 26); // 2026 - 2000
        assert_eq!(payload[9], 1);
        assert_eq!(payload[10], 15);
    }
}
