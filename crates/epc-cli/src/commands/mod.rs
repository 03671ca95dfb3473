//! Command implementations for epc

pub mod convert;
pub mod datalog;
pub mod device;
pub mod params;
pub mod pull;
pub mod valueset;

pub use convert::convert;
pub use datalog::{datalog, DatalogArgs};
pub use device::{open_device, read, save_to_nv, write, MetaArg};
pub use params::params;
pub use pull::{parse_address, pull, PullArgs};
pub use valueset::valueset;
