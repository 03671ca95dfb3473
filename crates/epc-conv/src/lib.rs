//! epc-conv - CAN matrix model and frame codec for EPC devices
//!
//! Bit-accurate packing and unpacking of CAN payloads with Intel and
//! Motorola signal layouts, multiplexed sub-frames and decimal-exact
//! scaling.
//!
//! # Quick Start
//!
//! ```rust
//! use epc_conv::{pack, unpack, Frame, Signal, SignalValues, SubFrame};
//!
//! let frame = Frame::new("ParameterQuery", 0x1FF00, true)
//!     .with_multiplexer(Signal::new("MUX", 0, 8))
//!     .with_sub_frame(SubFrame::new(
//!         3,
//!         "Frequency",
//!         vec![Signal::new("FrequencyReference", 16, 16).with_scaling("0.1", "0")],
//!     ));
//!
//! let mut values = SignalValues::new();
//! values.insert("MUX".into(), 3);
//! values.insert("FrequencyReference".into(), 600);
//!
//! let payload = pack(&frame, &values).unwrap();
//! assert_eq!(payload, vec![0x03, 0x00, 0x58, 0x02, 0, 0, 0, 0]);
//! assert_eq!(unpack(&frame, &payload).unwrap(), values);
//! ```
//!
//! # Scaling
//!
//! `physical = raw * factor + offset`, with factor and offset held as
//! `Decimal` so `600 * 0.1` is exactly `60.0`.

pub mod codec;
pub mod error;
pub mod frame;
pub mod matrix;
pub mod precision;
pub mod signal;
pub mod types;

// Re-export main types
pub use codec::{multiplex_select, pack, pack_frame, unpack, SignalValues};
pub use error::{format_can_id, parse_can_id, CodecError, CodecResult};
pub use frame::{Frame, SubFrame};
pub use matrix::{CanMatrix, MatrixMeta};
pub use precision::{decimal_from_f64, decimal_from_json, parse_decimal, to_json_number};
pub use rust_decimal::Decimal;
pub use signal::Signal;
pub use types::{ByteOrder, CanFrame};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::{pack, unpack, SignalValues};
    pub use crate::error::{CodecError, CodecResult};
    pub use crate::frame::{Frame, SubFrame};
    pub use crate::matrix::CanMatrix;
    pub use crate::signal::Signal;
    pub use crate::types::{ByteOrder, CanFrame};
}
