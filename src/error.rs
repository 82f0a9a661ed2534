use thiserror::Error;

/// Errors surfaced by the transport/protocol layers (C1/C2).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("XOR-CRC check failed on frame: {0:?}")]
    CrcFailure(Vec<u8>),
    #[error("response address 0x{received:04x} does not match requested 0x{expected:04x}")]
    AddressMismatch { expected: u16, received: u16 },
    #[error("unexpected response opcode 0x{0:04x}")]
    UnexpectedOpcode(u16),
    #[error("device reported error code {0} during end-transmission")]
    DeviceReported(u8),
    #[error("transmission timed out after 5 retries")]
    TransmissionTimeout,
}

/// Auth-layer failures: never retried automatically, always surfaced.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unlock key does not match the device's stored key")]
    KeyMismatch,
    #[error("device is not in pairing mode")]
    NotInPairingMode,
    #[error("failed to program the new pairing key onto the device")]
    KeyProgramFailed,
}

/// Top-level error type unifying the taxonomy in spec §7.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("failed to decode record: {0}")]
    Decode(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
