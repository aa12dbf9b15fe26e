//! Transaction log for Arbor.
//!
//! Committed transactions are appended to a single file as CRC-checked
//! records. On open, a tree replays or merges the log to recover writes that
//! never reached its data file.

pub mod constants;
pub mod logger;
pub mod reader;
pub mod record;
pub mod writer;

pub use logger::TransactionLogger;
pub use reader::{LogScanner, ReplayTarget};
pub use record::{LogEntry, LogEntrySerializer, OperationCode, TransactionState, TransactionToken};
pub use writer::{TransactionLog, TransactionLogConfig};
