//! epc-ccp - bulk memory access for EPC devices
//!
//! - [`CcpClient`]: CCP session (CONNECT, SET_MTA, UPLOAD, DISCONNECT) with
//!   per-frame retries and progress reporting
//! - [`MemoryCache`]: sparse memory image whose subscribers are told when a
//!   watched range changes
//! - [`datalog`]: decoding pulled datalogs into CSV
//!
//! # Example
//!
//! ```rust,no_run
//! use epc_bus::{create_bus, BusConfig};
//! use epc_ccp::{CcpClient, CcpConfig, UploadProgress};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = create_bus(&BusConfig::SocketCan { interface: "can0".into() })?;
//! let mut client = CcpClient::new(bus, CcpConfig::new(0x700, 0x701, false));
//!
//! let bytes = client
//!     .upload_block(0, 0x1000, 76, Some(|p: &UploadProgress| {
//!         println!("{:.0}%", p.percent());
//!     }))
//!     .await?;
//! println!("{} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod ccp;
pub mod datalog;
pub mod error;
pub mod progress;

pub use cache::{Chunk, MemoryCache, SubscriptionId};
pub use ccp::{CcpClient, CcpConfig};
pub use datalog::{
    BlockHeader, DatalogParser, LogChunk, LogRow, LogVariable, ParseSummary, VariableSet,
};
pub use error::{CcpError, CcpResult, DatalogError, DatalogResult};
pub use progress::{EtaEstimator, UploadProgress};
