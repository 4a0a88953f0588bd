use crate::protocol::{OpCode, ResultCode};

/// Errors surfaced while driving a DFU upgrade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("SLIP framing error: {0}")]
    Framing(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target answered a request with a non-success result code.
    #[error("target rejected {opcode:?}: {code:?}")]
    Remote {
        opcode: OpCode,
        code: ResultCode,
        ext: Option<u8>,
    },

    #[error(
        "CRC mismatch: host has {host_offset} bytes with CRC {host_crc:#010x}, \
         target reports {target_offset} bytes with CRC {target_crc:#010x}"
    )]
    CrcMismatch {
        host_offset: u32,
        host_crc: u32,
        target_offset: u32,
        target_crc: u32,
    },

    #[error("image source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;
