//! Application-layer operations atop [`Transport`] (C2): unlock, pairing,
//! and EEPROM block/continuous read-write.
//!
//! Grounded in `OmronBLEProtocol`'s `unlock_with_key`, `write_pairing_key`,
//! `read_eeprom_block`, `write_eeprom_block`, `read_continuous`, and
//! `write_continuous`.

use std::time::Duration;

use tracing::info;

use crate::error::{AuthError, BridgeError, ProtocolError};
use crate::transport::Transport;

/// 16-byte factory default pairing key. Devices ship unlocked with this key
/// until a caller programs a new one via [`pair`].
pub const DEFAULT_PAIRING_KEY: [u8; 16] = [
    0xde, 0xad, 0xbe, 0xaf, 0x12, 0x34, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xaf, 0x12, 0x34, 0x12, 0x34,
];

const UNLOCK_TIMEOUT: Duration = Duration::from_secs(1);
const PAIR_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum payload bytes a single EEPROM read can carry in one frame.
const MAX_READ_BLOCK: usize = 56;
/// Maximum payload bytes a single EEPROM write can carry in one frame.
const MAX_WRITE_BLOCK: usize = 8;

/// Unlock a paired device with its stored key, transitioning the session
/// from `Idle` to `Unlocked`.
pub async fn unlock(transport: &mut Transport, key: &[u8; 16]) -> Result<(), BridgeError> {
    let mut cmd = Vec::with_capacity(17);
    cmd.push(0x01);
    cmd.extend_from_slice(key);
    transport.write_unlock(&cmd).await.map_err(|e| BridgeError::Connectivity(e.to_string()))?;

    let resp = transport
        .recv_unlock(UNLOCK_TIMEOUT)
        .await
        .map_err(|_| BridgeError::Auth(AuthError::KeyMismatch))?;
    if resp.len() < 2 || resp[0..2] != [0x81, 0x00] {
        return Err(BridgeError::Auth(AuthError::KeyMismatch));
    }
    transport.mark_unlocked();
    Ok(())
}

/// Program a new pairing key onto a device that is in pairing mode
/// (factory "P" display). Two-step handshake: enter programming mode,
/// then push the new key.
pub async fn pair(transport: &mut Transport, new_key: &[u8; 16]) -> Result<(), BridgeError> {
    let enter_cmd = {
        let mut v = vec![0x02];
        v.extend_from_slice(&[0u8; 16]);
        v
    };
    transport
        .write_unlock(&enter_cmd)
        .await
        .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
    let resp = transport
        .recv_unlock(PAIR_TIMEOUT)
        .await
        .map_err(|_| BridgeError::Auth(AuthError::NotInPairingMode))?;
    if resp.len() < 2 || resp[0..2] != [0x82, 0x00] {
        return Err(BridgeError::Auth(AuthError::NotInPairingMode));
    }

    let mut program_cmd = vec![0x00];
    program_cmd.extend_from_slice(new_key);
    transport
        .write_unlock(&program_cmd)
        .await
        .map_err(|e| BridgeError::Connectivity(e.to_string()))?;
    let resp = transport
        .recv_unlock(PAIR_TIMEOUT)
        .await
        .map_err(|_| BridgeError::Auth(AuthError::KeyProgramFailed))?;
    if resp.len() < 2 || resp[0..2] != [0x80, 0x00] {
        return Err(BridgeError::Auth(AuthError::KeyProgramFailed));
    }

    info!("device paired with new key");
    Ok(())
}

/// Read up to [`MAX_READ_BLOCK`] bytes starting at `address`. Request type
/// 0x0100, response type 0x8100; the response address must echo the
/// request.
pub async fn read_eeprom_block(
    transport: &mut Transport,
    address: u16,
    block_size: u8,
) -> Result<Vec<u8>, BridgeError> {
    let cmd = Transport::build_command(0x0100, address, block_size, &[]);
    let frame = transport.send_and_wait(&cmd).await?;
    if frame.address != address {
        return Err(BridgeError::Protocol(ProtocolError::AddressMismatch {
            expected: address,
            received: frame.address,
        }));
    }
    if frame.packet_type != 0x8100 {
        return Err(BridgeError::Protocol(ProtocolError::UnexpectedOpcode(frame.packet_type)));
    }
    Ok(frame.payload)
}

/// Write `data` (at most [`MAX_WRITE_BLOCK`] bytes) starting at `address`.
/// Request type 0x01c0, response type 0x81c0.
pub async fn write_eeprom_block(
    transport: &mut Transport,
    address: u16,
    data: &[u8],
) -> Result<(), BridgeError> {
    let cmd = Transport::build_command(0x01c0, address, data.len() as u8, data);
    let frame = transport.send_and_wait(&cmd).await?;
    if frame.address != address {
        return Err(BridgeError::Protocol(ProtocolError::AddressMismatch {
            expected: address,
            received: frame.address,
        }));
    }
    if frame.packet_type != 0x81c0 {
        return Err(BridgeError::Protocol(ProtocolError::UnexpectedOpcode(frame.packet_type)));
    }
    Ok(())
}

/// Read `bytes_to_read` bytes starting at `start_address`, chunked into
/// `MAX_READ_BLOCK`-sized EEPROM reads.
pub async fn read_continuous(
    transport: &mut Transport,
    start_address: u16,
    bytes_to_read: usize,
) -> Result<Vec<u8>, BridgeError> {
    let mut data = Vec::with_capacity(bytes_to_read);
    let mut address = start_address;
    let mut remaining = bytes_to_read;
    while remaining > 0 {
        let chunk = remaining.min(MAX_READ_BLOCK);
        let block = read_eeprom_block(transport, address, chunk as u8).await?;
        data.extend_from_slice(&block);
        address += chunk as u16;
        remaining -= chunk;
    }
    Ok(data)
}

/// Write `data` starting at `start_address`, chunked into
/// `MAX_WRITE_BLOCK`-sized EEPROM writes.
pub async fn write_continuous(
    transport: &mut Transport,
    start_address: u16,
    data: &[u8],
) -> Result<(), BridgeError> {
    let mut address = start_address;
    for chunk in data.chunks(MAX_WRITE_BLOCK) {
        write_eeprom_block(transport, address, chunk).await?;
        address += chunk.len() as u16;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_command_carries_block_size_in_length_field_not_payload() {
        let cmd = Transport::build_command(0x0100, 0x0098, 56, &[]);
        assert_eq!(cmd.len(), 8);
        assert_eq!(cmd[5], 56);
    }

    #[test]
    fn write_command_length_field_matches_payload_len() {
        let data = [1u8, 2, 3, 4];
        let cmd = Transport::build_command(0x01c0, 0x0054, data.len() as u8, &data);
        assert_eq!(cmd.len(), 8 + data.len());
        assert_eq!(cmd[5] as usize, data.len());
    }

    #[test]
    fn default_pairing_key_matches_factory_constant() {
        assert_eq!(
            DEFAULT_PAIRING_KEY,
            [
                0xde, 0xad, 0xbe, 0xaf, 0x12, 0x34, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xaf, 0x12, 0x34,
                0x12, 0x34
            ]
        );
    }
}
