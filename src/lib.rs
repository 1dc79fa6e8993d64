// dirshare engine library
// Shares a local directory over HTTP on the LAN; embedded by the desktop CLI and mobile shells

pub mod error;
pub mod file_server;
pub mod log_broker;

pub use error::{ErrorResponse, ShareError};
pub use file_server::{
    ControlOutcome, PathResolver, ServerManager, ServerState, ServerStatus, ShareConfig,
};
pub use log_broker::{LogBroker, LogEntry, LogLevel, SubscriptionId};
