//! Library crate for slp-scan: probe hosts for game servers speaking the Server List Ping
//! protocol and collect their status JSON.
pub mod config;
pub mod connection;
pub mod error;
pub mod favicon;
pub mod hosts;
pub mod probe;
pub mod protocol;
pub mod scanner;
pub mod sink;
pub mod types;

pub use config::ScanConfig;
pub use error::{DecodeError, EncodeError, ProbeError};
pub use scanner::{ProgressSnapshot, ScanProgress, ScanStream, Scanner};
pub use types::{ScanResult, ScanSummary, Target};
