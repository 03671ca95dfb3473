//! CCP and datalog errors

use std::path::PathBuf;

use epc_bus::BusError;
use thiserror::Error;

/// Errors raised by the CCP client and the block upload engine
#[derive(Debug, Error)]
pub enum CcpError {
    #[error("Command counter mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CommandCounterMismatch { expected: u8, actual: u8 },

    #[error("No response to {command} within {timeout_ms} ms")]
    Timeout { command: &'static str, timeout_ms: u64 },

    #[error("{command} rejected with status {status:#04x}")]
    CommandRejected { command: &'static str, status: u8 },

    #[error("Malformed response: {0}")]
    InvalidResponse(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Bulk read of {octets} octets at {address:#010x} failed after {attempts} attempts: {reason}")]
    BulkReadFailed {
        address: u32,
        octets: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl CcpError {
    /// Errors worth repeating the current frame for
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CommandCounterMismatch { .. } | Self::Bus(_)
        )
    }
}

pub type CcpResult<T> = std::result::Result<T, CcpError>;

/// Errors raised while decoding a datalog stream
#[derive(Debug, Error)]
pub enum DatalogError {
    #[error("Software hash mismatch: log carries {found}, expected {expected}")]
    HashMismatch { found: String, expected: String },

    #[error("Truncated record {index} in block {block}: {reason}")]
    TruncatedRecord {
        block: usize,
        index: u32,
        reason: String,
    },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid variable definition: {0}")]
    InvalidVariable(String),

    #[error("Failed to read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DatalogResult<T> = std::result::Result<T, DatalogError>;
