//! Transfer engines.

pub mod http;
pub mod traits;

pub use http::{HttpEngine, HttpEngineConfig};
pub use traits::{Transfer, TransferEngine, TransferOptions, TransferRequest, TransferSink};
