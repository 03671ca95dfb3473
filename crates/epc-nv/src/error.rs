//! NV subsystem errors

use std::path::PathBuf;

use epc_bus::BusError;
use epc_conv::CodecError;
use thiserror::Error;

use crate::meta::MetaEnum;

/// Errors from loading a device description
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid CAN matrix: {0}")]
    Matrix(#[from] CodecError),

    #[error("Missing frame {0} required by the NV protocol")]
    MissingFrame(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from the NV registry, protocol and file codecs
#[derive(Debug, Error)]
pub enum NvError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate parameter name: {0}")]
    DuplicateName(String),

    #[error("Value {value} out of range for {name} [{}, {}]",
        .min.map_or("-".to_string(), |v| v.to_string()),
        .max.map_or("-".to_string(), |v| v.to_string()))]
    OutOfRange {
        name: String,
        value: i64,
        min: Option<i64>,
        max: Option<i64>,
    },

    #[error("Unknown multiplex value {value} in frame {frame}")]
    UnknownMultiplex { frame: String, value: u64 },

    #[error("Value {value} does not fit {name} ({bits} bits)")]
    WidthOverflow { name: String, value: i64, bits: u16 },

    #[error("Request timed out: {mux} {meta}")]
    RequestTimeout { mux: String, meta: MetaEnum },

    #[error("Send failed: {0}")]
    SendFailed(#[from] BusError),

    #[error("Response for {mux} is missing {missing:?}")]
    PartialResponse { mux: String, missing: Vec<String> },

    #[error("Request canceled")]
    Canceled,

    #[error("Meta {0} is not supported by this protocol variant")]
    UnsupportedMeta(MetaEnum),

    #[error("Cannot write {mux}: {name} is unknown and cannot be read back")]
    UnknownSibling { mux: String, name: String },

    #[error("Parameter {0} is read-only")]
    ReadOnly(String),

    #[error("Access level must be written together with the access password")]
    AccessPasswordRequired,

    #[error("A transaction is already open")]
    TransactionOpen,

    #[error("No transaction is open")]
    NoTransaction,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for NvError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::WidthOverflow {
                signal,
                value,
                bits,
                ..
            } => NvError::WidthOverflow {
                name: signal,
                value,
                bits,
            },
            CodecError::UnknownMultiplex { frame, value } => {
                NvError::UnknownMultiplex { frame, value }
            }
            other => NvError::Codec(other),
        }
    }
}

impl NvError {
    /// Failures a request is retried on
    pub fn is_retryable(&self) -> bool {
        matches!(self, NvError::RequestTimeout { .. } | NvError::SendFailed(_))
    }

    /// Failures the cyclic reader expects during normal operation
    pub fn is_expected_in_background(&self) -> bool {
        self.is_retryable() || matches!(self, NvError::Canceled)
    }
}

/// Result type for NV operations
pub type NvResult<T> = Result<T, NvError>;
