pub mod check_engine;
pub mod config;
pub mod error;
pub mod half_scanner;
pub mod metrics_consts;
pub mod op_index;
pub mod properties;
pub mod store;
pub mod types;

pub use check_engine::CheckEngine;
pub use error::{ScanError, StoreError};
pub use half_scanner::{BackCheckListener, HalfScanner, ScanOutcome};
pub use store::{BrokerStoreBridge, StoreBridge};
pub use types::{
    EndTransactionHeader, HalfMessage, MessageQueue, OpMessage, OperationResult, OperationStatus,
    PullResult, PullStatus, PutResult, PutStatus,
};
