//! 请求处理共享状态
//!
//! 每个运行中的会话一份，由所有连接共享只读访问。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::paths::PathResolver;
use crate::log_broker::LogBroker;

/// 会话统计
#[derive(Debug, Default)]
pub struct ServerStats {
    requests_served: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }
}

/// 处理器共享状态
pub struct ShareState {
    /// 以共享根目录为基准的路径解析器
    pub resolver: PathResolver,
    pub log: Arc<LogBroker>,
    pub stats: Arc<ServerStats>,
}

pub type SharedState = Arc<ShareState>;
