//! 局域网文件共享 Server 模块
//!
//! 将一个本地目录通过 HTTP 共享给同一网络内的浏览器：浏览、下载（文件夹打包为 zip）、
//! 上传与新建目录。默认监听 0.0.0.0:8000，无鉴权。

mod archive;
mod config;
mod handlers;
mod listing;
mod network;
mod paths;
mod server;
mod state;

pub use archive::build_zip;
pub use config::{ShareConfig, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE_SECS};
pub use listing::{format_size, DirectoryEntry};
pub use network::local_address;
pub use paths::{sanitize_file_name, PathResolver};
pub use server::{ControlOutcome, ServerHandle, ServerManager, ServerState, ServerStatus};
pub use state::ServerStats;
